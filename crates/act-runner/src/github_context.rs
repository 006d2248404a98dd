// Builds the `github` context from configuration and the trigger payload, and
// projects it into the `GITHUB_*` environment of step processes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use act_common::constants::{variables, DEFAULT_ACTOR};

use crate::config::Config;

/// The `github` context available in expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubContext {
    pub event: Value,
    pub event_path: String,
    pub workflow: String,
    pub run_id: String,
    pub run_number: String,
    pub actor: String,
    pub repository: String,
    pub event_name: String,
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub ref_name: String,
    pub ref_type: String,
    pub head_ref: String,
    pub base_ref: String,
    pub token: String,
    pub workspace: String,
    pub action: String,
    pub action_path: String,
    pub action_ref: String,
    pub action_repository: String,
    pub job: String,
    pub repository_owner: String,
    pub retention_days: String,
    pub runner_perflog: String,
    pub runner_tracking_id: String,
    pub server_url: String,
    pub api_url: String,
    pub graphql_url: String,
}

/// Everything the builder reads besides the configuration.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs<'a> {
    pub workflow_name: &'a str,
    pub job_id: &'a str,
    pub current_step: &'a str,
    pub action_path: &'a str,
    pub event_json: &'a str,
    /// Path of `workflow/event.json` inside the running environment.
    pub event_path: Option<String>,
    /// Workspace path inside the running environment.
    pub workspace: Option<String>,
}

impl GitHubContext {
    /// Derive the context. A configured preset replaces derivation of the trigger fields.
    pub fn build(config: &Config, inputs: &ContextInputs<'_>) -> GitHubContext {
        let env = |name: &str| config.env.get(name).cloned().unwrap_or_default();

        let mut ghc = GitHubContext {
            event: Value::Object(Default::default()),
            workflow: inputs.workflow_name.to_string(),
            run_id: env("GITHUB_RUN_ID"),
            run_number: env("GITHUB_RUN_NUMBER"),
            actor: config.actor.clone(),
            event_name: config.event_name.clone(),
            action: inputs.current_step.to_string(),
            token: config.token.clone(),
            job: inputs.job_id.to_string(),
            action_path: inputs.action_path.to_string(),
            repository_owner: env("GITHUB_REPOSITORY_OWNER"),
            retention_days: env("GITHUB_RETENTION_DAYS"),
            runner_perflog: env("RUNNER_PERFLOG"),
            runner_tracking_id: env("RUNNER_TRACKING_ID"),
            repository: env("GITHUB_REPOSITORY"),
            git_ref: env("GITHUB_REF"),
            sha: env("SHA_REF"),
            ref_name: env("GITHUB_REF_NAME"),
            ref_type: env("GITHUB_REF_TYPE"),
            base_ref: env("GITHUB_BASE_REF"),
            head_ref: env("GITHUB_HEAD_REF"),
            workspace: env("GITHUB_WORKSPACE"),
            ..GitHubContext::default()
        };
        if let Some(path) = &inputs.event_path {
            ghc.event_path = path.clone();
        }
        if let Some(workspace) = &inputs.workspace {
            ghc.workspace = workspace.clone();
        }

        default_if_empty(&mut ghc.run_id, "1");
        default_if_empty(&mut ghc.run_number, "1");
        default_if_empty(&mut ghc.retention_days, "0");
        default_if_empty(&mut ghc.runner_perflog, "/dev/null");
        default_if_empty(&mut ghc.actor, DEFAULT_ACTOR);

        if let Some(preset) = &config.preset_github_context {
            ghc.apply_preset(preset);
            return ghc;
        }

        if !inputs.event_json.trim().is_empty() {
            match serde_json::from_str::<Value>(inputs.event_json) {
                Ok(event) => ghc.event = event,
                Err(e) => tracing::error!(target: "job", "Unable to parse event '{}': {}", inputs.event_json, e),
            }
        }

        ghc.set_base_and_head_ref();
        ghc.set_repository_and_owner();
        if ghc.git_ref.is_empty() {
            ghc.set_ref(&config.default_branch);
        }
        if ghc.sha.is_empty() {
            ghc.set_sha();
        }
        ghc.set_ref_type_and_name();
        ghc.set_endpoints(config);
        ghc
    }

    fn apply_preset(&mut self, preset: &GitHubContext) {
        self.event = preset.event.clone();
        self.run_id = preset.run_id.clone();
        self.run_number = preset.run_number.clone();
        self.actor = preset.actor.clone();
        self.repository = preset.repository.clone();
        self.event_name = preset.event_name.clone();
        self.sha = preset.sha.clone();
        self.git_ref = preset.git_ref.clone();
        self.ref_name = preset.ref_name.clone();
        self.ref_type = preset.ref_type.clone();
        self.head_ref = preset.head_ref.clone();
        self.base_ref = preset.base_ref.clone();
        self.token = preset.token.clone();
        self.repository_owner = preset.repository_owner.clone();
        self.retention_days = preset.retention_days.clone();
    }

    fn event_str(&self, path: &[&str]) -> Option<String> {
        let mut current = &self.event;
        for key in path {
            current = current.get(key)?;
        }
        match current {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn is_pull_request_event(&self) -> bool {
        matches!(self.event_name.as_str(), "pull_request" | "pull_request_target")
    }

    fn set_base_and_head_ref(&mut self) {
        if !self.is_pull_request_event() {
            return;
        }
        if self.base_ref.is_empty() {
            self.base_ref = self.event_str(&["pull_request", "base", "ref"]).unwrap_or_default();
        }
        if self.head_ref.is_empty() {
            self.head_ref = self.event_str(&["pull_request", "head", "ref"]).unwrap_or_default();
        }
    }

    fn set_repository_and_owner(&mut self) {
        if self.repository.is_empty() {
            self.repository = self
                .event_str(&["repository", "full_name"])
                .unwrap_or_default();
        }
        if self.repository_owner.is_empty() {
            self.repository_owner = self
                .repository
                .split_once('/')
                .map(|(owner, _)| owner.to_string())
                .unwrap_or_default();
        }
    }

    fn set_ref(&mut self, default_branch: &str) {
        let from_event = match self.event_name.as_str() {
            "pull_request_target" => self
                .event_str(&["pull_request", "base", "ref"])
                .map(|base| format!("refs/heads/{base}")),
            "pull_request" | "pull_request_review" | "pull_request_review_comment" => self
                .event_str(&["number"])
                .map(|number| format!("refs/pull/{number}/merge")),
            "deployment" | "deployment_status" => self.event_str(&["deployment", "ref"]),
            "release" => self
                .event_str(&["release", "tag_name"])
                .map(|tag| format!("refs/tags/{tag}")),
            "push" | "create" | "workflow_dispatch" => self.event_str(&["ref"]),
            _ => None,
        };
        self.git_ref = from_event.unwrap_or_else(|| {
            let branch = self
                .event_str(&["repository", "default_branch"])
                .unwrap_or_else(|| default_branch.to_string());
            format!("refs/heads/{branch}")
        });
    }

    fn set_sha(&mut self) {
        self.sha = self
            .event_str(&["after"])
            .or_else(|| self.event_str(&["pull_request", "head", "sha"]))
            .or_else(|| self.event_str(&["head_commit", "id"]))
            .unwrap_or_default();
    }

    fn set_ref_type_and_name(&mut self) {
        let (ref_type, ref_name) = if let Some(name) = self.git_ref.strip_prefix("refs/tags/") {
            ("tag", name)
        } else if let Some(name) = self.git_ref.strip_prefix("refs/heads/") {
            ("branch", name)
        } else if let Some(name) = self.git_ref.strip_prefix("refs/pull/") {
            ("", name)
        } else {
            ("", "")
        };
        let (ref_type, ref_name) = (ref_type.to_string(), ref_name.to_string());
        default_if_empty(&mut self.ref_type, &ref_type);
        default_if_empty(&mut self.ref_name, &ref_name);
    }

    fn set_endpoints(&mut self, config: &Config) {
        let instance = config.github_instance.as_str();
        if instance == "github.com" {
            self.server_url = "https://github.com".to_string();
            self.api_url = "https://api.github.com".to_string();
            self.graphql_url = "https://api.github.com/graphql".to_string();
        } else {
            self.server_url = format!("https://{instance}");
            self.api_url = format!("https://{instance}/api/v3");
            self.graphql_url = format!("https://{instance}/api/graphql");
        }
        for (name, field) in [
            ("GITHUB_SERVER_URL", &mut self.server_url),
            ("GITHUB_API_URL", &mut self.api_url),
            ("GITHUB_GRAPHQL_URL", &mut self.graphql_url),
        ] {
            if let Some(value) = config.env.get(name).filter(|v| !v.is_empty()) {
                *field = value.clone();
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

fn default_if_empty(field: &mut String, default: &str) {
    if field.is_empty() {
        *field = default.to_string();
    }
}

/// Project the context into step environment variables.
///
/// `runs_on` are the job's interpolated runner labels; the last non-empty one sets `ImageOS`.
pub fn with_github_env(
    ghc: &GitHubContext,
    config: &Config,
    runs_on: &[String],
    env: &mut HashMap<String, String>,
) {
    let mut set = |name: &str, value: &str| {
        env.insert(name.to_string(), value.to_string());
    };
    set(variables::CI, "true");
    set("GITHUB_WORKFLOW", &ghc.workflow);
    set("GITHUB_RUN_ID", &ghc.run_id);
    set("GITHUB_RUN_NUMBER", &ghc.run_number);
    set("GITHUB_ACTION", &ghc.action);
    set("GITHUB_ACTION_PATH", &ghc.action_path);
    set("GITHUB_ACTION_REPOSITORY", &ghc.action_repository);
    set("GITHUB_ACTION_REF", &ghc.action_ref);
    set("GITHUB_ACTIONS", "true");
    set("GITHUB_ACTOR", &ghc.actor);
    set("GITHUB_REPOSITORY", &ghc.repository);
    set("GITHUB_EVENT_NAME", &ghc.event_name);
    set("GITHUB_EVENT_PATH", &ghc.event_path);
    set("GITHUB_WORKSPACE", &ghc.workspace);
    set("GITHUB_SHA", &ghc.sha);
    set("GITHUB_REF", &ghc.git_ref);
    set("GITHUB_REF_NAME", &ghc.ref_name);
    set("GITHUB_REF_TYPE", &ghc.ref_type);
    set("GITHUB_TOKEN", &ghc.token);
    set("GITHUB_JOB", &ghc.job);
    set("GITHUB_REPOSITORY_OWNER", &ghc.repository_owner);
    set("GITHUB_RETENTION_DAYS", &ghc.retention_days);
    set("RUNNER_PERFLOG", &ghc.runner_perflog);
    set("RUNNER_TRACKING_ID", &ghc.runner_tracking_id);
    set("GITHUB_BASE_REF", &ghc.base_ref);
    set("GITHUB_HEAD_REF", &ghc.head_ref);
    set("GITHUB_SERVER_URL", &ghc.server_url);
    set("GITHUB_API_URL", &ghc.api_url);
    set("GITHUB_GRAPHQL_URL", &ghc.graphql_url);

    if config.github_instance != "github.com" {
        // Gitea serves its REST API under /api/v1 and has no GraphQL endpoint.
        let instance = if config.github_instance.starts_with("http://")
            || config.github_instance.starts_with("https://")
        {
            config.github_instance.clone()
        } else {
            format!("https://{}", config.github_instance)
        };
        set("GITHUB_SERVER_URL", &instance);
        set("GITHUB_API_URL", &format!("{instance}/api/v1"));
        set("GITHUB_GRAPHQL_URL", "");
    }

    if !config.artifact_server_path.is_empty() {
        let url = std::env::var(variables::ACTIONS_RUNTIME_URL)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "http://{}:{}/",
                    config.artifact_server_addr, config.artifact_server_port
                )
            });
        let token = std::env::var(variables::ACTIONS_RUNTIME_TOKEN)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "token".to_string());
        set(variables::ACTIONS_RUNTIME_URL, &url);
        set(variables::ACTIONS_RUNTIME_TOKEN, &token);
    }

    if let Some(image_os) = runs_on.iter().rev().find_map(|label| image_os(label)) {
        set("ImageOS", &image_os);
    }
}

/// `ImageOS` for a runner label: `ubuntu-22.04` becomes `ubuntu22`.
pub fn image_os(label: &str) -> Option<String> {
    if label.is_empty() {
        return None;
    }
    if label == "ubuntu-latest" {
        return Some("ubuntu20".to_string());
    }
    let without_dash = label.replacen('-', "", 1);
    Some(
        without_dash
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(event_json: &str) -> ContextInputs<'_> {
        ContextInputs {
            workflow_name: "ci",
            job_id: "build",
            event_json,
            ..ContextInputs::default()
        }
    }

    #[test]
    fn test_defaults_without_event() {
        let config = Config::default();
        let ghc = GitHubContext::build(&config, &inputs(""));
        assert_eq!(ghc.run_id, "1");
        assert_eq!(ghc.run_number, "1");
        assert_eq!(ghc.retention_days, "0");
        assert_eq!(ghc.runner_perflog, "/dev/null");
        assert_eq!(ghc.actor, "nektos/act");
        assert_eq!(ghc.git_ref, "refs/heads/main");
        assert_eq!(ghc.ref_name, "main");
        assert_eq!(ghc.ref_type, "branch");
        assert_eq!(ghc.api_url, "https://api.github.com");
    }

    #[test]
    fn test_pull_request_event() {
        let mut config = Config::default();
        config.event_name = "pull_request".into();
        let event = r#"{"number": 7, "pull_request": {"base": {"ref": "main"}, "head": {"ref": "feature", "sha": "abc"}},
                        "repository": {"full_name": "octo/repo"}}"#;
        let ghc = GitHubContext::build(&config, &inputs(event));
        assert_eq!(ghc.base_ref, "main");
        assert_eq!(ghc.head_ref, "feature");
        assert_eq!(ghc.git_ref, "refs/pull/7/merge");
        assert_eq!(ghc.ref_name, "7/merge");
        assert_eq!(ghc.ref_type, "");
        assert_eq!(ghc.sha, "abc");
        assert_eq!(ghc.repository, "octo/repo");
        assert_eq!(ghc.repository_owner, "octo");
    }

    #[test]
    fn test_tag_push_and_env_overrides() {
        let mut config = Config::default();
        config.github_instance = "ghe.example.com".into();
        config.env.insert("GITHUB_API_URL".into(), "https://api.internal".into());
        let ghc = GitHubContext::build(&config, &inputs(r#"{"ref": "refs/tags/v1.2"}"#));
        assert_eq!(ghc.ref_type, "tag");
        assert_eq!(ghc.ref_name, "v1.2");
        assert_eq!(ghc.server_url, "https://ghe.example.com");
        assert_eq!(ghc.api_url, "https://api.internal");
        assert_eq!(ghc.graphql_url, "https://ghe.example.com/api/graphql");
    }

    #[test]
    fn test_preset_replaces_derivation() {
        let mut config = Config::default();
        config.preset_github_context = Some(GitHubContext {
            repository: "gitea/runner".into(),
            git_ref: "refs/heads/release".into(),
            run_id: "42".into(),
            ..GitHubContext::default()
        });
        let ghc = GitHubContext::build(&config, &inputs(r#"{"ref": "refs/heads/ignored"}"#));
        assert_eq!(ghc.repository, "gitea/runner");
        assert_eq!(ghc.git_ref, "refs/heads/release");
        assert_eq!(ghc.run_id, "42");
        assert_eq!(ghc.ref_name, "");
    }

    #[test]
    fn test_github_env_for_gitea_instance() {
        let mut config = Config::default();
        config.github_instance = "gitea.example.com".into();
        let ghc = GitHubContext::build(&config, &inputs(""));
        let mut env = HashMap::new();
        with_github_env(&ghc, &config, &["ubuntu-22.04".to_string()], &mut env);
        assert_eq!(env["CI"], "true");
        assert_eq!(env["GITHUB_SERVER_URL"], "https://gitea.example.com");
        assert_eq!(env["GITHUB_API_URL"], "https://gitea.example.com/api/v1");
        assert_eq!(env["GITHUB_GRAPHQL_URL"], "");
        assert_eq!(env["ImageOS"], "ubuntu22");
        assert_eq!(env["GITHUB_JOB"], "build");
    }

    #[test]
    fn test_image_os() {
        assert_eq!(image_os("ubuntu-latest").as_deref(), Some("ubuntu20"));
        assert_eq!(image_os("ubuntu-20.04").as_deref(), Some("ubuntu20"));
        assert_eq!(image_os("self-hosted").as_deref(), Some("selfhosted"));
        assert_eq!(image_os(""), None);
    }
}

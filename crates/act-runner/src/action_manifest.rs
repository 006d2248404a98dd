// Parses action.yml / action.yaml into the action data model.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::model::{opt_scalar, string_map, string_or_seq, Step};

pub const MANIFEST_FILES: [&str; 2] = ["action.yml", "action.yaml"];

/// Parsed action definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActionManifest {
    pub name: String,
    pub description: String,
    pub inputs: HashMap<String, ActionInput>,
    pub outputs: HashMap<String, ActionOutput>,
    pub runs: ActionRuns,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActionInput {
    pub description: String,
    #[serde(deserialize_with = "opt_scalar")]
    pub required: Option<String>,
    #[serde(deserialize_with = "opt_scalar")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActionOutput {
    pub description: String,
    /// Expression producing the output of a composite action.
    pub value: Option<String>,
}

/// The `runs:` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ActionRuns {
    pub using: String,
    pub main: Option<String>,
    pub pre: Option<String>,
    #[serde(deserialize_with = "opt_scalar")]
    pub pre_if: Option<String>,
    pub post: Option<String>,
    #[serde(deserialize_with = "opt_scalar")]
    pub post_if: Option<String>,
    pub image: Option<String>,
    pub entrypoint: Option<String>,
    #[serde(deserialize_with = "string_or_seq")]
    pub args: Vec<String>,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Node,
    Docker,
    Composite,
}

impl ActionRuns {
    pub fn kind(&self) -> Result<ActionKind> {
        match self.using.to_ascii_lowercase().as_str() {
            "node12" | "node16" | "node20" | "node24" => Ok(ActionKind::Node),
            "docker" => Ok(ActionKind::Docker),
            "composite" => Ok(ActionKind::Composite),
            other => bail!(
                "The runs.using key must be one of: [node12 node16 node20 node24 docker composite], got {}",
                other
            ),
        }
    }

    /// `pre-if`, defaulting to `always()`.
    pub fn pre_if(&self) -> &str {
        non_empty_or_always(self.pre_if.as_deref())
    }

    /// `post-if`, defaulting to `always()`.
    pub fn post_if(&self) -> &str {
        non_empty_or_always(self.post_if.as_deref())
    }

    pub fn has_pre(&self) -> bool {
        self.pre.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn has_post(&self) -> bool {
        self.post.as_deref().is_some_and(|p| !p.is_empty())
    }
}

fn non_empty_or_always(condition: Option<&str>) -> &str {
    match condition {
        Some(c) if !c.trim().is_empty() => c,
        _ => "always()",
    }
}

impl ActionManifest {
    pub fn parse(content: &str) -> Result<ActionManifest> {
        let manifest: ActionManifest =
            serde_yaml::from_str(content).context("Failed to parse action YAML")?;
        manifest.runs.kind()?;
        Ok(manifest)
    }

    /// Load the manifest of the action in `dir`, trying `action.yml` first.
    pub fn load(dir: &Path) -> Result<ActionManifest> {
        for file in MANIFEST_FILES {
            let path = dir.join(file);
            if path.is_file() {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                return Self::parse(&content)
                    .with_context(|| format!("Invalid action manifest {}", path.display()));
            }
        }
        bail!(
            "Can't find 'action.yml' or 'action.yaml' under '{}'. Did you forget to run actions/checkout before running your local action?",
            dir.display()
        )
    }

    /// Input defaults for inputs the step did not provide.
    pub fn input_defaults(&self) -> HashMap<String, String> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| input.default.clone().map(|d| (name.clone(), d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_action_hooks_and_inputs() {
        let yaml = r#"
name: setup-toolchain
inputs:
  channel:
    required: false
    default: stable
outputs:
  toolchain-path:
    description: where the toolchain was installed
runs:
  using: node20
  main: lib/main.js
  pre: lib/pre.js
  post: lib/post.js
  post-if: success()
"#;
        let manifest = ActionManifest::parse(yaml).unwrap();
        assert_eq!(manifest.name, "setup-toolchain");
        assert_eq!(manifest.runs.kind().unwrap(), ActionKind::Node);
        assert_eq!(manifest.runs.main.as_deref(), Some("lib/main.js"));
        assert!(manifest.runs.has_pre());
        assert_eq!(manifest.runs.pre_if(), "always()");
        assert_eq!(manifest.runs.post_if(), "success()");
        assert_eq!(manifest.input_defaults().get("channel").map(String::as_str), Some("stable"));
        assert!(manifest.outputs.contains_key("toolchain-path"));
    }

    #[test]
    fn test_composite_action_steps_and_output_values() {
        let yaml = r#"
name: lint
inputs:
  config:
    default: .lint.toml
outputs:
  report:
    value: ${{ steps.scan.outputs.file }}
runs:
  using: composite
  steps:
    - run: lint --config ${{ inputs.config }}
      shell: sh
    - id: scan
      run: echo "file=lint.json" >> "$GITHUB_OUTPUT"
      shell: sh
"#;
        let manifest = ActionManifest::parse(yaml).unwrap();
        assert_eq!(manifest.runs.kind().unwrap(), ActionKind::Composite);
        assert_eq!(manifest.runs.steps.len(), 2);
        assert_eq!(manifest.runs.steps[1].id, "scan");
        assert_eq!(
            manifest.outputs["report"].value.as_deref(),
            Some("${{ steps.scan.outputs.file }}")
        );
    }

    #[test]
    fn test_docker_action_args_kept_raw() {
        let yaml = r#"
runs:
  using: docker
  image: docker://alpine:3.20
  args: ['--flag', '${{ inputs.value }}']
"#;
        let manifest = ActionManifest::parse(yaml).unwrap();
        assert_eq!(manifest.runs.kind().unwrap(), ActionKind::Docker);
        assert_eq!(manifest.runs.args, vec!["--flag", "${{ inputs.value }}"]);
    }

    #[test]
    fn test_unknown_runtime_rejected() {
        assert!(ActionManifest::parse("runs:\n  using: python\n").is_err());
    }

    #[test]
    fn test_load_prefers_yml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("action.yaml"), "name: yaml\nruns:\n  using: composite\n").unwrap();
        std::fs::write(dir.path().join("action.yml"), "name: yml\nruns:\n  using: composite\n").unwrap();
        assert_eq!(ActionManifest::load(dir.path()).unwrap().name, "yml");

        let empty = tempfile::tempdir().unwrap();
        assert!(ActionManifest::load(empty.path()).is_err());
    }
}

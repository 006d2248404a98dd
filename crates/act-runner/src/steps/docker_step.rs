// `uses: docker://image` steps and docker actions: a one-shot container that
// joins the job network and sees the job's workspace.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::process_invoker::split_args;

use crate::commands::line_handler;
use crate::container::orchestrator::create_simple_container_name;
use crate::container::ContainerInput;
use crate::error::RunnerError;
use crate::model::Step;
use crate::run_context::RunContext;

use super::{Stage, StepHandler};

pub struct DockerStep {
    rc: Arc<RunContext>,
    step: Step,
}

impl DockerStep {
    pub fn new(rc: Arc<RunContext>, step: Step) -> Self {
        Self { rc, step }
    }
}

#[async_trait]
impl StepHandler for DockerStep {
    fn step(&self) -> &Step {
        &self.step
    }

    async fn execute(&self, _stage: Stage, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()> {
        let uses = self.step.uses.as_deref().unwrap_or_default();
        let image = self.rc.interpolate(uses.trim_start_matches("docker://"));
        let ctx = self.rc.expression_context();
        let with = self.rc.evaluator().interpolate_map(&ctx, &self.step.with);
        let entrypoint = with.get("entrypoint").map(|e| split_args(e)).unwrap_or_default();
        let cmd = with.get("args").map(|a| split_args(a)).unwrap_or_default();
        run_step_container(&self.rc, &self.step.id, image, entrypoint, cmd, env, cancel).await
    }
}

/// Pull, create and attach to a step container, removing it afterwards
/// unless containers are reused.
pub(super) async fn run_step_container(
    rc: &Arc<RunContext>,
    step_id: &str,
    image: String,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
    env: HashMap<String, String>,
    cancel: CancellationToken,
) -> Result<()> {
    let (binds, mounts) = rc.binds_and_mounts();
    let input = ContainerInput {
        name: create_simple_container_name(&[&rc.job_container_name(), &format!("STEP-{step_id}")]),
        image,
        entrypoint,
        cmd,
        env: env.into_iter().collect(),
        working_dir: rc.container_workdir(),
        binds,
        mounts,
        network_mode: rc.network_name(),
        privileged: rc.config.privileged,
        userns_mode: rc.config.userns_mode.clone(),
        platform: rc.config.container_architecture.clone(),
        options: rc.config.container_options.clone(),
        auto_remove: rc.config.auto_remove,
        output: Some(line_handler(rc)),
        ..ContainerInput::default()
    };
    let container = rc
        .services
        .driver
        .new_container(input)
        .ok_or_else(|| RunnerError::ContainerCreate("step".into()))?;

    let reuse = rc.config.reuse_containers;
    let result = async {
        if !reuse {
            container.remove(cancel.clone()).await?;
        }
        container.pull(rc.config.force_pull, cancel.clone()).await?;
        container
            .create(&rc.config.container_cap_add, &rc.config.container_cap_drop, cancel.clone())
            .await?;
        container.start(true, cancel.clone()).await
    }
    .await;

    if !reuse {
        if let Err(e) = container.remove(CancellationToken::new()).await {
            tracing::warn!(target: "container", "Failed to remove step container {}: {:#}", container.name(), e);
        }
    }
    result
}

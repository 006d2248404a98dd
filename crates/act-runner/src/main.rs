// Entry point of the `act-runner` binary.
//
// Parses flags, layers them over the optional config file, plans the selected
// workflow and hands the plan to the `Runner`. Ctrl-C cancels the run; the
// environments of running jobs are still torn down.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::logging::{self, LogFormat};
use act_runner::container::{DockerCli, DockerCliDriver};
use act_runner::expressions::BasicEvaluator;
use act_runner::git_fetcher::GitCliFetcher;
use act_runner::planner::YamlWorkflowPlanner;
use act_runner::source_cache::SourceCache;
use act_runner::{Config, Runner, RunnerServices};

#[derive(Parser, Debug)]
#[command(name = "act-runner", version, about = "Run workflow jobs locally in containers")]
struct Args {
    /// Workflow file to run, relative to the working directory.
    #[arg(short = 'W', long, env = "ACT_WORKFLOW", default_value = ".github/workflows/ci.yml")]
    workflow: PathBuf,

    /// Event that triggers the workflow.
    #[arg(short, long, env = "ACT_EVENT")]
    event: Option<String>,

    /// JSON payload of the event.
    #[arg(long, env = "ACT_EVENT_PATH")]
    event_path: Option<PathBuf>,

    /// Run only this job and the jobs it needs.
    #[arg(short, long, env = "ACT_JOB")]
    job: Option<String>,

    /// YAML config file.
    #[arg(short, long, env = "ACT_CONFIG")]
    config: Option<PathBuf>,

    /// Working directory holding the checkout.
    #[arg(short = 'C', long, env = "ACT_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Platform mapping, `label=image`. `-self-hosted` runs on the host.
    #[arg(short = 'P', long = "platform", env = "ACT_PLATFORMS", value_delimiter = ',')]
    platforms: Vec<String>,

    /// Secret, `NAME=VALUE`.
    #[arg(short, long = "secret", env = "ACT_SECRETS", value_delimiter = ',')]
    secrets: Vec<String>,

    /// Bind the working directory into the job container instead of copying it.
    #[arg(short, long, env = "ACT_BIND")]
    bind: bool,

    /// Keep containers between runs.
    #[arg(short, long, env = "ACT_REUSE")]
    reuse: bool,

    /// Log step output at info level.
    #[arg(long, env = "ACT_LOG_OUTPUT")]
    log_output: bool,

    /// More diagnostics (`-v` debug, `-vv` trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON.
    #[arg(long, env = "ACT_JSON_LOGS")]
    json: bool,
}

fn parse_pair(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("expected NAME=VALUE, got '{raw}'"),
    }
}

/// The config file (or defaults) with the flags applied on top.
fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(workdir) = &args.workdir {
        config.workdir = workdir.clone();
    }
    config.workdir = std::fs::canonicalize(&config.workdir)
        .with_context(|| format!("invalid working directory {}", config.workdir.display()))?;
    if let Some(event) = &args.event {
        config.event_name = event.clone();
    }
    if args.event_path.is_some() {
        config.event_path = args.event_path.clone();
    }
    for raw in &args.platforms {
        let (label, image) = parse_pair(raw)?;
        config.platforms.insert(label, image);
    }
    for raw in &args.secrets {
        let (name, value) = parse_pair(raw)?;
        config.secrets.insert(name, value);
    }
    config.bind_workdir |= args.bind;
    config.reuse_containers |= args.reuse;
    config.log_output |= args.log_output;
    Ok(config.normalized())
}

async fn run(args: Args) -> Result<()> {
    let config = Arc::new(build_config(&args)?);

    let driver = DockerCliDriver::new(DockerCli::new(&config.container_daemon_socket)?);
    let fetcher = GitCliFetcher::new()?;
    let services = Arc::new(RunnerServices {
        driver: Arc::new(driver),
        cache: Arc::new(SourceCache::from_config(&config, Arc::new(fetcher))),
        evaluator: Arc::new(BasicEvaluator::new()),
        planner: Arc::new(YamlWorkflowPlanner),
        http: reqwest::Client::new(),
    });

    let workflow = config.workdir.join(&args.workflow);
    let plan = match &args.job {
        Some(job) => services.planner.plan_job(&workflow, job)?,
        None => services.planner.plan_event(&workflow, &config.event_name)?,
    };
    if plan.is_empty() {
        tracing::info!("Nothing to run for event '{}'", config.event_name);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling the run");
                cancel.cancel();
            }
        });
    }

    Runner::new(config, services)?.run(&plan, cancel).await?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    let format = if args.json { LogFormat::Json } else { LogFormat::Text };
    if let Err(e) = logging::init(logging::level_for_verbosity(args.verbose), format) {
        eprintln!("{e:#}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = match runtime.block_on(run(args)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

// Child-process execution with line-oriented output callbacks and graceful cancellation
// (SIGINT, then SIGTERM, then kill).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long to wait after SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// How long to wait after SIGTERM before killing the process.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error("exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// Callback invoked once per line of process output.
pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Description of a process to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting the runner's.
    pub clear_env: bool,
    /// Bytes written to stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    fn command_line(&self) -> String {
        self.args.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if self.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&self.environment);
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Result of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawns processes and streams their output, line by line, to callbacks.
#[derive(Clone, Default)]
pub struct ProcessInvoker {
    on_stdout: Option<LineHandler>,
    on_stderr: Option<LineHandler>,
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stdout(mut self, handler: LineHandler) -> Self {
        self.on_stdout = Some(handler);
        self
    }

    pub fn on_stderr(mut self, handler: LineHandler) -> Self {
        self.on_stderr = Some(handler);
        self
    }

    /// Run the process to completion, delivering output lines to the handlers.
    ///
    /// Cancellation interrupts the process and yields an error.
    pub async fn execute(&self, request: &ProcessRequest, cancel: CancellationToken) -> Result<ExecOutcome> {
        tracing::debug!(
            target: "process",
            "Starting process '{}' with arguments '{}'",
            request.program,
            request.command_line()
        );

        let mut child = request.command().spawn().with_context(|| {
            format!(
                "failed to start process '{}' with arguments '{}'",
                request.program,
                request.command_line()
            )
        })?;
        write_stdin(&mut child, request.stdin.as_deref()).await?;

        let stdout_task = spawn_line_reader(child.stdout.take(), self.on_stdout.clone());
        let stderr_task = spawn_line_reader(child.stderr.take(), self.on_stderr.clone());

        let exit_code = tokio::select! {
            status = child.wait() => {
                status.context("failed to wait for process")?.code().unwrap_or(-1)
            }
            _ = cancel.cancelled() => {
                let code = cancel_and_kill(&mut child).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                tracing::debug!(target: "process", "Process '{}' cancelled (exit code {})", request.program, code);
                anyhow::bail!("process '{}' was cancelled", request.program);
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        tracing::debug!(target: "process", "Finished process '{}' with exit code {}", request.program, exit_code);
        Ok(ExecOutcome { exit_code })
    }

    /// Like [`execute`](Self::execute) but a non-zero exit code is a [`ProcessExitCodeError`].
    pub async fn execute_checked(&self, request: &ProcessRequest, cancel: CancellationToken) -> Result<()> {
        let outcome = self.execute(request, cancel).await?;
        if !outcome.success() {
            return Err(ProcessExitCodeError {
                exit_code: outcome.exit_code,
                file_name: request.program.clone(),
                arguments: request.command_line(),
            }
            .into());
        }
        Ok(())
    }

    /// Run the process and collect raw stdout. A non-zero exit code is an error
    /// that carries the collected stderr.
    pub async fn capture(request: &ProcessRequest, cancel: CancellationToken) -> Result<Vec<u8>> {
        let mut child = request.command().spawn().with_context(|| {
            format!("failed to start process '{}'", request.program)
        })?;
        write_stdin(&mut child, request.stdin.as_deref()).await?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async {
            let mut buf = String::new();
            if let Some(err) = stderr.as_mut() {
                err.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let (out, err, status) = tokio::select! {
            result = async { tokio::join!(read_stdout, read_stderr, child.wait()) } => result,
            _ = cancel.cancelled() => {
                anyhow::bail!("process '{}' was cancelled", request.program);
            }
        };

        let status = status.context("failed to wait for process")?;
        let out = out.context("failed to read process stdout")?;
        let err = err.unwrap_or_default();
        if !status.success() {
            return Err(ProcessExitCodeError {
                exit_code: status.code().unwrap_or(-1),
                file_name: request.program.clone(),
                arguments: request.command_line(),
            })
            .with_context(|| err.trim().to_string());
        }
        Ok(out)
    }
}

async fn write_stdin(child: &mut Child, input: Option<&[u8]>) -> Result<()> {
    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input).await.context("failed to write process stdin")?;
        stdin.shutdown().await.ok();
    }
    Ok(())
}

fn spawn_line_reader<R>(stream: Option<R>, handler: Option<LineHandler>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else { return };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(handler) = &handler {
                handler(&line);
            }
        }
    })
}

async fn cancel_and_kill(child: &mut Child) -> i32 {
    if send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT).await
        || send_signal_and_wait(child, Signal::Term, SIGTERM_TIMEOUT).await
    {
        return child.wait().await.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
    }
    let _ = child.kill().await;
    child.wait().await.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

#[cfg(unix)]
async fn send_signal_and_wait(child: &mut Child, signal: Signal, timeout: Duration) -> bool {
    let Some(pid) = child.id() else {
        return true;
    };
    let sig = match signal {
        Signal::Int => nix::sys::signal::Signal::SIGINT,
        Signal::Term => nix::sys::signal::Signal::SIGTERM,
    };
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
        return false;
    }
    tokio::time::timeout(timeout, child.wait()).await.is_ok()
}

#[cfg(not(unix))]
async fn send_signal_and_wait(child: &mut Child, _signal: Signal, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, child.wait()).await.is_ok()
}

/// Split a command string into arguments, honouring single quotes, double quotes and backslash escapes.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escape_next = false;
    let mut has_token = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if !in_single => escape_next = true,
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token || !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => current.push(c),
        }
    }
    if has_token || !current.is_empty() {
        args.push(current);
    }
    args
}

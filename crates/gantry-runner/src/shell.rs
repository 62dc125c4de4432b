//! Shell-based step execution on the host.

use crate::runner::{RunnerConfig, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use gantry_core::pipeline::{StepDefinition, StepKind};
use gantry_core::run::{LogLine, LogStream};
use gantry_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Shell runner for executing `run:` scripts on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Arguments placing the shell in fail-fast mode: the first failing
    /// command line ends the script with its exit status.
    fn shell_args(shell: &str) -> &'static [&'static str] {
        match shell {
            "bash" => &["--noprofile", "--norc", "-eo", "pipefail", "-c"],
            "sh" | "dash" | "zsh" => &["-e", "-c"],
            _ => &["-c"],
        }
    }

    async fn execute_script(
        &self,
        shell: &str,
        script: &str,
        ctx: &StepContext,
        output_tx: mpsc::Sender<LogLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();

        info!(
            step = %ctx.step.name,
            shell = %shell,
            workspace = %ctx.workspace.display(),
            "Executing shell step"
        );

        let mut command = Command::new(shell);
        command
            .args(Self::shell_args(shell))
            .arg(script)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .envs(&ctx.step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The script and everything it starts share one process group.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn {}: {}", shell, e)))?;
        let mut group = ProcessGroup::new(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("Child stderr not captured".to_string()))?;

        let stdout_handle = stream_lines(stdout, LogStream::Stdout, output_tx.clone());
        let stderr_handle = stream_lines(stderr, LogStream::Stderr, output_tx);

        let limit = self.config.timeout_for(&ctx.step);
        let status = match timeout(limit, child.wait()).await {
            Ok(result) => result
                .map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?,
            Err(_) => {
                warn!(step = %ctx.step.name, timeout_secs = limit.as_secs(), "Step timed out, killing process group");
                group.kill();
                let _ = child.kill().await;
                stdout_handle.abort();
                stderr_handle.abort();
                return Err(Error::StepTimeout {
                    minutes: (limit.as_secs() / 60) as u32,
                });
            }
        };

        // Leftover background processes would hold the output pipes open.
        group.kill();

        // Drain output before reporting so the log is complete.
        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(step = %ctx.step.name, exit_code, duration_ms, "Shell step completed");

        Ok(StepResult::from_exit_code(exit_code, duration_ms))
    }
}

/// Kills the step's whole process group on [`ProcessGroup::kill`] or drop,
/// so nothing a script started survives a cancelled or finished step.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn stream_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<LogLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;

        while let Ok(Some(content)) = lines.next_line().await {
            line_number += 1;
            let line = LogLine {
                stream,
                line_number,
                content,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(line).await.is_err() {
                break;
            }
        }
    })
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<LogLine>,
    ) -> Result<StepResult> {
        let StepKind::Shell { run, shell } = &ctx.step.kind else {
            return Err(Error::Internal(format!(
                "Step {} is not a shell step",
                ctx.step.name
            )));
        };

        let script = ctx.interpolation.interpolate(run);
        self.execute_script(shell, &script, ctx, output_tx).await
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.is_shell()
    }
}

//! External process boundary
//!
//! Every call out to `systemctl`, `ps`, `rpm` and friends goes through a
//! [`CommandRunner`], so the service and resource layers can be driven by a
//! scripted runner in tests.

use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tracing::{debug, warn};

/// Exit code reported when a command could not be spawned or timed out.
pub const EXIT_NOT_RUN: i32 = -1;

/// Captured result of one external process invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn not_run(reason: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_NOT_RUN,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }
}

/// Runs a program with arguments and reports its exit code and output.
///
/// Implementations never fail: spawn errors and timeouts are folded into
/// an [`EXIT_NOT_RUN`] result with empty stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput;
}

/// Runs commands on the host, killing any that outlive `timeout`.
///
/// `run` blocks the calling thread. Inside the agent it is called from
/// `spawn_blocking` and drives the child on the ambient multi-threaded
/// runtime; without a runtime it brings up a current-thread one for the
/// call. It must not be called directly from an async task.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn spawn_and_wait(&self, program: &str, args: &[&str]) -> io::Result<Option<CommandOutput>> {
        let child = Command::new(program)
            .args(args)
            .env("LANG", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // On timeout the child is dropped with the future and killed.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(Some(CommandOutput {
                    exit_code: output.status.code().unwrap_or(EXIT_NOT_RUN),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }))
            }
            Err(_) => Ok(None),
        }
    }
}

fn block_on<F: Future>(future: F) -> io::Result<F::Output> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => Ok(Builder::new_current_thread().enable_all().build()?.block_on(future)),
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        let started = Instant::now();
        debug!("exec: {} {}", program, args.join(" "));

        match block_on(self.spawn_and_wait(program, args)).and_then(|outcome| outcome) {
            Ok(Some(output)) => {
                debug!(
                    "exec: {program} exited with {} after {:?}",
                    output.exit_code,
                    started.elapsed()
                );
                output
            }
            Ok(None) => {
                warn!("exec: {program} timed out after {:?}", self.timeout);
                CommandOutput::not_run(format!("timed out after {:?}", self.timeout))
            }
            Err(e) => {
                warn!("exec: failed to run {program}: {e}");
                CommandOutput::not_run(e.to_string())
            }
        }
    }
}

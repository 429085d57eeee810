use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Grace period between SIGTERM and SIGKILL escalation.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle states of the supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Terminating,
    Exited,
    TimedOut,
}

impl State {
    /// Advances the state machine, logging the transition.
    fn advance(&mut self, next: State) {
        debug!(from = ?*self, to = ?next, "supervisor state transition");
        *self = next;
    }
}

/// Terminal outcome of one supervised run.
#[derive(Debug)]
pub enum ChildOutcome {
    /// The child exited on its own before the deadline.
    Exited(ExitStatus),
    /// The deadline was hit; the child was signalled and reaped.
    TimedOut,
    /// The session was aborted externally; the child was signalled and reaped.
    Aborted,
}

/// Launches the wrapped command and enforces a maximum runtime.
///
/// Exactly one cancellation broadcast reaches the rest of the session on
/// every exit path, regardless of which race branch wins.
pub struct Supervisor {
    max_runtime: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn new(max_runtime: Duration) -> Self {
        Self {
            max_runtime,
            grace: TERM_GRACE,
        }
    }

    #[cfg(test)]
    fn with_grace(max_runtime: Duration, grace: Duration) -> Self {
        Self { max_runtime, grace }
    }

    /// Spawns the command and drives it to a terminal state.
    ///
    /// The child inherits standard streams and is placed in its own process
    /// group so descendants are caught by termination signals.
    pub async fn run(&self, argv: &[String], cancel: CancellationToken) -> Result<ChildOutcome> {
        let result = self.run_child(argv, &cancel).await;
        // Broadcast once on every exit path; idempotent if the abort branch
        // already fired.
        cancel.cancel();
        result
    }

    async fn run_child(&self, argv: &[String], cancel: &CancellationToken) -> Result<ChildOutcome> {
        let (program, args) = argv
            .split_first()
            .context("wrapped command must not be empty")?;

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning wrapped command '{program}'"))?;

        info!(command = %argv.join(" "), pid = child.id(), "wrapped command started");

        let mut state = State::Running;
        let deadline = tokio::time::sleep(self.max_runtime);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            status = child.wait() => {
                state.advance(State::Exited);
                let status = status.context("waiting for wrapped command")?;
                debug!(?status, "wrapped command exited");
                ChildOutcome::Exited(status)
            }
            () = &mut deadline => {
                state.advance(State::Terminating);
                warn!(
                    max_runtime_secs = self.max_runtime.as_secs_f64(),
                    "max runtime reached, terminating wrapped command",
                );
                self.terminate(&mut child).await?;
                state.advance(State::TimedOut);
                ChildOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                state.advance(State::Terminating);
                warn!("session aborted, terminating wrapped command");
                self.terminate(&mut child).await?;
                state.advance(State::Exited);
                ChildOutcome::Aborted
            }
        };

        Ok(outcome)
    }

    /// Signals the child's process group to terminate, escalating to a
    /// forced kill after the grace period.
    async fn terminate(&self, child: &mut Child) -> Result<()> {
        signal_group(child, SIGTERM);

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => {
                let status = status.context("reaping terminated command")?;
                debug!(?status, "wrapped command terminated cleanly");
            }
            Err(_) => {
                warn!(
                    grace_secs = self.grace.as_secs_f64(),
                    "wrapped command ignored SIGTERM, killing",
                );
                signal_group(child, SIGKILL);
                child.wait().await.context("reaping killed command")?;
            }
        }

        Ok(())
    }
}

/// Sends a signal to the child's process group, falling back to the child
/// itself if the group signal fails (already reaped, or non-Unix).
#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    let Some(pid) = child.id() else {
        return; // Already reaped.
    };

    // The child leads its own process group (process_group(0) at spawn).
    // SAFETY: killpg with a valid pgid and signal has no memory-safety
    // preconditions.
    let rc = unsafe { libc::killpg(pid as i32, signal) };
    if rc != 0 {
        warn!(
            pid,
            signal,
            errno = std::io::Error::last_os_error().raw_os_error(),
            "process group signal failed",
        );
    }
}

#[cfg(not(unix))]
fn signal_group(child: &Child, _signal: i32) {
    // No process groups; kill_on_drop covers the child itself.
    let _ = child;
}

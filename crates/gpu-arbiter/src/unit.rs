//! Lifecycle control of the managed unit hosting the background job.
//!
//! Start and stop block until the unit reaches the target state or the transition
//! timeout elapses. Command failures are logged here and surface to callers only
//! as `false`.

use core::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tokio::time::sleep;

/// Default bound on a start/stop transition.
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSITION_POLL_STEP: Duration = Duration::from_secs(1);

/// Errors raised by unit lifecycle commands.
#[derive(Debug, Display)]
pub enum UnitError {
    #[display("Failed to execute `{command}`")]
    Spawn { command: String },
    #[display("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

impl Error for UnitError {}

/// Start/stop/query a managed unit by identifier.
#[async_trait]
pub trait UnitLifecycle: Send + Sync {
    async fn is_running(&self, id: &str) -> bool;

    /// Start the unit and wait for it to report running.
    async fn start(&self, id: &str) -> bool;

    /// Stop the unit and wait for it to report stopped.
    async fn stop(&self, id: &str) -> bool;
}

/// Tooling used to drive the managed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Display)]
pub enum UnitBackend {
    /// Proxmox LXC container driven through `pct`
    #[display("pct")]
    Pct,
    /// systemd service driven through `systemctl`
    #[display("systemctl")]
    Systemd,
}

impl UnitBackend {
    fn program(self) -> &'static str {
        match self {
            UnitBackend::Pct => "pct",
            UnitBackend::Systemd => "systemctl",
        }
    }
}

/// [`UnitLifecycle`] backed by the host's container or service manager CLI.
pub struct CommandUnit {
    backend: UnitBackend,
    transition_timeout: Duration,
    poll_step: Duration,
}

impl CommandUnit {
    pub fn new(backend: UnitBackend, transition_timeout: Duration) -> Self {
        Self {
            backend,
            transition_timeout,
            poll_step: TRANSITION_POLL_STEP,
        }
    }

    pub fn backend(&self) -> UnitBackend {
        self.backend
    }

    /// Whether the backend CLI can be executed on this host.
    pub async fn is_available(&self) -> bool {
        let args: &[&str] = match self.backend {
            UnitBackend::Pct => &["list"],
            UnitBackend::Systemd => &["--version"],
        };
        run(self.backend.program(), args).await.is_ok()
    }

    async fn query_running(&self, id: &str) -> Result<bool, Report<UnitError>> {
        match self.backend {
            UnitBackend::Pct => {
                let listing = run("pct", &["list"]).await?;
                Ok(pct_list_reports_running(&listing, id))
            }
            UnitBackend::Systemd => {
                let status = Command::new("systemctl")
                    .args(["is-active", "--quiet", id])
                    .status()
                    .await
                    .change_context_lazy(|| UnitError::Spawn {
                        command: format!("systemctl is-active {id}"),
                    })?;
                Ok(status.success())
            }
        }
    }

    /// Poll until the unit reports `target` or the transition timeout elapses.
    async fn wait_for(&self, id: &str, target: bool) -> bool {
        let mut waited = Duration::ZERO;
        while self.is_running(id).await != target && waited < self.transition_timeout {
            sleep(self.poll_step).await;
            waited += self.poll_step;
        }
        self.is_running(id).await == target
    }
}

#[async_trait]
impl UnitLifecycle for CommandUnit {
    async fn is_running(&self, id: &str) -> bool {
        match self.query_running(id).await {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(unit = %id, "Failed to query unit status: {e:?}");
                false
            }
        }
    }

    async fn start(&self, id: &str) -> bool {
        if self.is_running(id).await {
            tracing::debug!(unit = %id, "Unit already running, no action needed");
            return true;
        }

        tracing::info!(unit = %id, "Starting unit");
        if let Err(e) = run(self.backend.program(), &["start", id]).await {
            tracing::error!(unit = %id, "Failed to start unit: {e:?}");
            return false;
        }

        if self.wait_for(id, true).await {
            tracing::info!(unit = %id, "Unit started successfully");
            true
        } else {
            tracing::error!(
                unit = %id,
                "Unit failed to start within {:?}",
                self.transition_timeout
            );
            false
        }
    }

    async fn stop(&self, id: &str) -> bool {
        if !self.is_running(id).await {
            tracing::debug!(unit = %id, "Unit already stopped, no action needed");
            return true;
        }

        tracing::info!(unit = %id, "Stopping unit");
        if let Err(e) = run(self.backend.program(), &["stop", id]).await {
            tracing::error!(unit = %id, "Failed to stop unit: {e:?}");
            return false;
        }

        if self.wait_for(id, false).await {
            tracing::info!(unit = %id, "Unit stopped successfully");
            true
        } else {
            tracing::warn!(
                unit = %id,
                "Unit still running after {:?}",
                self.transition_timeout
            );
            false
        }
    }
}

/// Run a command to completion and return its stdout.
async fn run(program: &str, args: &[&str]) -> Result<String, Report<UnitError>> {
    let command = format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .change_context_lazy(|| UnitError::Spawn {
            command: command.clone(),
        })?;

    if !output.status.success() {
        return Err(Report::new(UnitError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Find the row whose VMID column equals `id` and check its status column.
fn pct_list_reports_running(listing: &str, id: &str) -> bool {
    listing.lines().any(|line| {
        let mut columns = line.split_whitespace();
        columns.next() == Some(id) && columns.next() == Some("running")
    })
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    const LISTING: &str = "\
VMID       Status     Lock         Name
120        running                 miner
1200       stopped                 backup
121        stopped                 ollama";

    #[test]
    fn pct_listing_matches_exact_vmid() {
        assert!(pct_list_reports_running(LISTING, "120"));
        assert!(!pct_list_reports_running(LISTING, "1200"));
        assert!(!pct_list_reports_running(LISTING, "121"));
    }

    #[test]
    fn pct_listing_without_unit_is_not_running() {
        assert!(!pct_list_reports_running(LISTING, "999"));
        assert!(!pct_list_reports_running("", "120"));
    }

    #[test]
    fn pct_header_row_is_never_a_match() {
        assert!(!pct_list_reports_running(LISTING, "VMID"));
    }

    #[test(tokio::test)]
    async fn missing_program_is_a_spawn_error() {
        let result = run("definitely-not-a-real-unit-tool", &["list"]).await;

        let report = result.expect_err("spawning a missing binary should fail");
        assert!(matches!(
            report.current_context(),
            UnitError::Spawn { .. }
        ));
    }

    #[test]
    fn backend_programs() {
        assert_eq!(UnitBackend::Pct.program(), "pct");
        assert_eq!(UnitBackend::Systemd.program(), "systemctl");
        assert_eq!(UnitBackend::Systemd.to_string(), "systemctl");
    }
}

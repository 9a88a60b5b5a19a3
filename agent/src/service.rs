//! Host service manager wrapper (systemd)
//!
//! Status and PID come from scraping `systemctl status` output. The grammar
//! is two literal markers:
//!
//! ```text
//!      Active: <state> (<detail>) since ...
//!    Main PID: <pid> (<comm>)
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::error::{AgentError, AgentResult};

const SYSTEMCTL: &str = "systemctl";
const ACTIVE_MARKER: &str = "Active:";
const MAIN_PID_MARKER: &str = "Main PID:";

/// Run state reported by the service manager.
///
/// `Unknown` means the status could not be queried at all. It is never a
/// synonym for `Inactive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
    Other(String),
    Unknown,
}

impl ServiceState {
    pub fn parse(state: &str) -> Self {
        match state {
            "" => ServiceState::Unknown,
            "active" => ServiceState::Active,
            "inactive" => ServiceState::Inactive,
            "failed" => ServiceState::Failed,
            other => ServiceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ServiceState::Active => "active",
            ServiceState::Inactive => "inactive",
            ServiceState::Failed => "failed",
            ServiceState::Other(s) => s,
            ServiceState::Unknown => "",
        }
    }

    /// States in which a start request has nothing to do.
    pub fn is_up(&self) -> bool {
        match self {
            ServiceState::Active => true,
            ServiceState::Other(s) => matches!(s.as_str(), "activating" | "reloading" | "running"),
            _ => false,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Unknown => f.write_str("unknown"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Serialize for ServiceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Extract `<state>` from the first `Active: <state> (...)` line.
pub fn parse_active_state(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(ACTIVE_MARKER)?;
        rest.split_whitespace()
            .next()
            .filter(|state| !state.starts_with('('))
            .map(str::to_string)
    })
}

/// Extract the numeric PID following `Main PID:`.
pub fn parse_main_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let idx = line.find(MAIN_PID_MARKER)?;
        let rest = line[idx + MAIN_PID_MARKER.len()..].trim_start();
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok().filter(|&pid| pid != 0)
    })
}

/// Starts, stops and inspects named host services.
///
/// Holds no state between calls; every query shells out again.
#[derive(Clone)]
pub struct ServiceController {
    runner: Arc<dyn CommandRunner>,
}

impl ServiceController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn query(&self, service: &str) -> String {
        // systemctl exits 3 for inactive units yet still prints the status
        // block, so the output is parsed whatever the exit code.
        self.runner
            .run(SYSTEMCTL, &["status", service, "--no-pager"])
            .stdout
    }

    pub fn status(&self, service: &str) -> ServiceState {
        match parse_active_state(&self.query(service)) {
            Some(state) => ServiceState::parse(&state),
            None => {
                warn!("Could not determine status of service {service}");
                ServiceState::Unknown
            }
        }
    }

    pub fn pid(&self, service: &str) -> Option<u32> {
        parse_main_pid(&self.query(service))
    }

    /// Start `service` unless it is already up.
    pub fn start(&self, service: &str) -> AgentResult<()> {
        let state = self.status(service);
        if state.is_up() {
            info!("Service {service} already {state}, nothing to start");
            return Ok(());
        }
        self.transition(service, "start")
    }

    /// Stop `service` unless it is already inactive.
    ///
    /// A `failed` unit is still sent a stop so systemd clears its state.
    pub fn stop(&self, service: &str) -> AgentResult<()> {
        if self.status(service) == ServiceState::Inactive {
            info!("Service {service} already inactive, nothing to stop");
            return Ok(());
        }
        self.transition(service, "stop")
    }

    fn transition(&self, service: &str, verb: &str) -> AgentResult<()> {
        info!("Issuing systemctl {verb} {service}");
        let output = self.runner.run(SYSTEMCTL, &[verb, service]);
        if output.success() {
            Ok(())
        } else {
            warn!(
                "systemctl {verb} {service} failed ({}): {}",
                output.exit_code,
                output.stderr.trim()
            );
            Err(AgentError::CommandFailed(format!(
                "systemctl {verb} {service} exited with {}",
                output.exit_code
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    const STATUS_FAILED: &str = "● gala-gopher.service - a-ops gala gopher service\n     Loaded: loaded (/usr/lib/systemd/system/gala-gopher.service; enabled)\n     Active: failed (Result: exit-code) since Mon 2023-07-03 15:57:07 CST; 24h ago\n";
    const STATUS_ACTIVE: &str = "     Active: active (running) since Tue 2023-07-04 09:00:00 CST; 5min ago\n   Main PID: 749 (gala-gopher)\n";
    const STATUS_INACTIVE: &str = "     Active: inactive (dead)\n";

    fn controller(runner: ScriptedRunner) -> (ServiceController, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (ServiceController::new(runner.clone()), runner)
    }

    #[test]
    fn test_parse_active_state() {
        let line = " Active: failed (Result: exit-code) since Mon 2023-07-03 15:57:07 CST; 24h ago";
        assert_eq!(parse_active_state(line).as_deref(), Some("failed"));
        assert_eq!(parse_active_state(STATUS_ACTIVE).as_deref(), Some("active"));
        assert_eq!(parse_active_state(""), None);
        assert_eq!(parse_active_state("Unit foo.service could not be found."), None);
    }

    #[test]
    fn test_parse_main_pid() {
        assert_eq!(parse_main_pid("Main PID: 749"), Some(749));
        assert_eq!(parse_main_pid(STATUS_ACTIVE), Some(749));
        assert_eq!(parse_main_pid(""), None);
        assert_eq!(parse_main_pid("Main PID: 0"), None);
        assert_eq!(parse_main_pid("Main PID: abc"), None);
    }

    #[test]
    fn test_status_failed() {
        let (ctl, _) = controller(ScriptedRunner::new().on("systemctl status", 3, STATUS_FAILED));
        assert_eq!(ctl.status("gala-gopher"), ServiceState::Failed);
    }

    #[test]
    fn test_status_unknown_when_command_fails() {
        let (ctl, _) = controller(ScriptedRunner::new().on("systemctl status", 1, ""));
        let state = ctl.status("gala-gopher");
        assert_eq!(state, ServiceState::Unknown);
        assert_eq!(state.as_str(), "");
        assert_ne!(state, ServiceState::Inactive);
    }

    #[test]
    fn test_pid_from_status_output() {
        let (ctl, _) = controller(ScriptedRunner::new().on("systemctl status", 0, "Main PID: 749"));
        assert_eq!(ctl.pid("gala-gopher"), Some(749));
    }

    #[test]
    fn test_pid_empty_on_command_failure() {
        let (ctl, _) = controller(ScriptedRunner::new().on("systemctl status", 1, ""));
        assert_eq!(ctl.pid("gala-gopher"), None);
    }

    #[test]
    fn test_start_is_idempotent_when_active() {
        let (ctl, runner) = controller(
            ScriptedRunner::new()
                .on("systemctl status", 0, STATUS_ACTIVE)
                .on("systemctl start", 0, ""),
        );
        assert!(ctl.start("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl start"), 0);
    }

    #[test]
    fn test_start_skips_when_running_state_reported() {
        let (ctl, runner) = controller(
            ScriptedRunner::new().on("systemctl status", 0, "Active: running (pid 12)"),
        );
        assert!(ctl.start("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl start"), 0);
    }

    #[test]
    fn test_start_issues_command_when_inactive() {
        let (ctl, runner) = controller(
            ScriptedRunner::new()
                .on("systemctl status", 3, STATUS_INACTIVE)
                .on("systemctl start", 0, ""),
        );
        assert!(ctl.start("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl start gala-gopher"), 1);
    }

    #[test]
    fn test_start_fails_when_command_fails() {
        let (ctl, _) = controller(
            ScriptedRunner::new()
                .on("systemctl status", 3, STATUS_FAILED)
                .on("systemctl start", 1, ""),
        );
        let err = ctl.start("gala-gopher").unwrap_err();
        assert!(matches!(err, AgentError::CommandFailed(_)));
    }

    #[test]
    fn test_start_issues_command_when_status_unknown() {
        let (ctl, runner) = controller(
            ScriptedRunner::new()
                .on("systemctl status", 1, "")
                .on("systemctl start", 0, ""),
        );
        assert!(ctl.start("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl start"), 1);
    }

    #[test]
    fn test_stop_is_idempotent_when_inactive() {
        let (ctl, runner) = controller(ScriptedRunner::new().on("systemctl status", 3, STATUS_INACTIVE));
        assert!(ctl.stop("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl stop"), 0);
    }

    #[test]
    fn test_stop_still_issued_for_failed_unit() {
        let (ctl, runner) = controller(
            ScriptedRunner::new()
                .on("systemctl status", 3, STATUS_FAILED)
                .on("systemctl stop", 0, ""),
        );
        assert!(ctl.stop("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl stop gala-gopher"), 1);
    }

    #[test]
    fn test_stop_running_service() {
        let (ctl, _) = controller(
            ScriptedRunner::new()
                .on("systemctl status", 0, STATUS_ACTIVE)
                .on("systemctl stop", 0, ""),
        );
        assert!(ctl.stop("gala-gopher").is_ok());
    }

    #[test]
    fn test_state_display_and_serialize() {
        assert_eq!(ServiceState::Unknown.to_string(), "unknown");
        assert_eq!(serde_json::to_string(&ServiceState::Unknown).unwrap(), "\"\"");
        assert_eq!(serde_json::to_string(&ServiceState::Failed).unwrap(), "\"failed\"");
    }
}

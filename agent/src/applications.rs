//! Scan for well-known applications running as services

use serde::Serialize;
use tracing::debug;

use crate::service::{ServiceController, ServiceState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunningApplications {
    pub running: Vec<String>,
}

/// Names from `candidates` whose service is currently `active`.
pub fn running_applications(services: &ServiceController, candidates: &[String]) -> RunningApplications {
    let running = candidates
        .iter()
        .filter(|name| {
            let state = services.status(name);
            debug!("Application {name}: {state}");
            state == ServiceState::Active
        })
        .cloned()
        .collect();
    RunningApplications { running }
}

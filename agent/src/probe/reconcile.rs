//! Apply a requested probe → mode mapping to a probe document
//!
//! Reconciliation is split into a pure planning step over the current
//! probes and an explicit apply step that mutates the document. There is
//! no rollback: every accepted change is applied even when other entries
//! in the same request are rejected.

use std::collections::HashMap;

use serde::Serialize;

use super::{Probe, ProbeConfigDocument, SwitchMode};

/// Why a requested change was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// No probe with that name exists in either group.
    NotFound,
    /// `auto` was requested for a probe without a start check.
    AutoUnsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub name: String,
    pub requested: SwitchMode,
    pub reason: RejectReason,
}

/// Outcome of one reconciliation, both lists in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub success: Vec<String>,
    pub failure: Vec<Rejection>,
}

impl ReconciliationReport {
    pub fn failed_names(&self) -> Vec<String> {
        self.failure.iter().map(|r| r.name.clone()).collect()
    }

    /// Names that failed together with the mode that was asked for.
    pub fn failure_modes(&self) -> Vec<(&str, SwitchMode)> {
        self.failure
            .iter()
            .map(|r| (r.name.as_str(), r.requested))
            .collect()
    }
}

/// Accepted changes plus the report describing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Final mode per changed probe, in the order each was first accepted.
    pub changes: Vec<(String, SwitchMode)>,
    pub report: ReconciliationReport,
}

impl ReconcilePlan {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

pub struct ProbeReconciler;

impl ProbeReconciler {
    /// Decide which requested changes can be applied to `probes`.
    ///
    /// A name requested more than once is judged each time; its last
    /// accepted mode wins and it is listed once. A name that is accepted at
    /// least once never appears in `failure`.
    pub fn plan<'a, I>(probes: I, requested: &[(String, SwitchMode)]) -> ReconcilePlan
    where
        I: IntoIterator<Item = &'a Probe>,
    {
        let lookup: HashMap<&str, &Probe> = probes
            .into_iter()
            .map(|probe| (probe.name.as_str(), probe))
            .collect();

        let mut plan = ReconcilePlan::default();
        for (name, mode) in requested {
            let verdict = match lookup.get(name.as_str()) {
                None => Err(RejectReason::NotFound),
                Some(probe) if *mode == SwitchMode::Auto && !probe.supports_auto() => {
                    Err(RejectReason::AutoUnsupported)
                }
                Some(_) => Ok(()),
            };

            match verdict {
                Ok(()) => {
                    plan.report.failure.retain(|r| &r.name != name);
                    match plan.changes.iter_mut().find(|(changed, _)| changed == name) {
                        Some(change) => change.1 = *mode,
                        None => {
                            plan.changes.push((name.clone(), *mode));
                            plan.report.success.push(name.clone());
                        }
                    }
                }
                Err(reason) => {
                    if plan.report.success.contains(name) {
                        continue;
                    }
                    let rejection = Rejection {
                        name: name.clone(),
                        requested: *mode,
                        reason,
                    };
                    match plan.report.failure.iter_mut().find(|r| &r.name == name) {
                        Some(existing) => *existing = rejection,
                        None => plan.report.failure.push(rejection),
                    }
                }
            }
        }
        plan
    }

    /// Write the planned modes into `document`. Returns how many probes changed.
    pub fn apply(document: &mut ProbeConfigDocument, plan: &ReconcilePlan) -> usize {
        let mut applied = 0;
        for probe in document.probes_mut() {
            if let Some((_, mode)) = plan.changes.iter().find(|(name, _)| *name == probe.name) {
                probe.set_switch(*mode);
                applied += 1;
            }
        }
        applied
    }

    /// Plan and apply in one step.
    pub fn reconcile(
        document: &mut ProbeConfigDocument,
        requested: &[(String, SwitchMode)],
    ) -> ReconcilePlan {
        let plan = Self::plan(document.probes(), requested);
        Self::apply(document, &plan);
        plan
    }
}

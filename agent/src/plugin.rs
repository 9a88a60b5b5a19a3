//! Plugin lifecycle: install detection, start/stop, status snapshots and
//! the probe switches of plugins that expose collection items.
//!
//! The set of plugins is closed. Each descriptor names a [`PluginKind`],
//! and the kind decides which capabilities the plugin has.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::error::{AgentError, AgentResult};
use crate::probe::{ProbeConfigStore, ProbeReconciler, SwitchMode};
use crate::resource::ResourceInspector;
use crate::service::{ServiceController, ServiceState};

/// Implementation variant of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Collector with a switchable probe configuration.
    GalaGopher,
    /// Managed as a service only.
    ServiceOnly,
}

/// Static description of an installable plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub service_name: &'static str,
    pub rpm_name: &'static str,
    pub kind: PluginKind,
}

pub const INSTALLABLE_PLUGINS: &[PluginDescriptor] = &[
    PluginDescriptor {
        name: "gala-gopher",
        service_name: "gala-gopher",
        rpm_name: "gala-gopher",
        kind: PluginKind::GalaGopher,
    },
    PluginDescriptor {
        name: "gala-spider",
        service_name: "gala-spider",
        rpm_name: "gala-spider",
        kind: PluginKind::ServiceOnly,
    },
];

/// Probe state shown for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectItemStatus {
    pub probe_name: String,
    pub probe_status: SwitchMode,
    pub support_auto: bool,
}

/// Result of a probe switch request as reported to callers: failure
/// reasons stay inside the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemsChangeResult {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

impl ItemsChangeResult {
    pub fn all_failed(requested: &[(String, SwitchMode)]) -> Self {
        let mut failure: Vec<String> = Vec::new();
        for (name, _) in requested {
            if !failure.contains(name) {
                failure.push(name.clone());
            }
        }
        Self {
            success: Vec::new(),
            failure,
        }
    }
}

/// Capability of plugins whose collection items can be switched.
pub trait ProbeCollector: Send + Sync {
    /// Every probe with its current mode, base group first.
    fn collect_status(&self) -> Vec<CollectItemStatus>;

    /// Names of all probes; empty when the configuration is unavailable.
    fn collect_items(&self) -> BTreeSet<String>;

    /// Apply `requested` and persist the document when anything changed.
    fn change_items_status(&self, requested: &[(String, SwitchMode)]) -> ItemsChangeResult;
}

/// gala-gopher: probes live in its TOML probe document.
pub struct GalaGopher {
    store: ProbeConfigStore,
    // load → reconcile → save must not interleave within this process.
    write_lock: Mutex<()>,
}

impl GalaGopher {
    pub fn new(store: ProbeConfigStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }
}

impl ProbeCollector for GalaGopher {
    fn collect_status(&self) -> Vec<CollectItemStatus> {
        self.store
            .load()
            .probes()
            .map(|probe| CollectItemStatus {
                probe_name: probe.name.clone(),
                probe_status: probe.switch(),
                support_auto: probe.supports_auto(),
            })
            .collect()
    }

    fn collect_items(&self) -> BTreeSet<String> {
        self.store.load().probes().map(|p| p.name.clone()).collect()
    }

    fn change_items_status(&self, requested: &[(String, SwitchMode)]) -> ItemsChangeResult {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut document = self.store.load();
        if document.is_empty() {
            warn!(
                "No probes available in {}, rejecting all {} requested changes",
                self.store.path().display(),
                requested.len()
            );
        }

        let plan = ProbeReconciler::reconcile(&mut document, requested);
        for rejection in &plan.report.failure {
            warn!(
                "Probe {} cannot be set to {}: {:?}",
                rejection.name, rejection.requested, rejection.reason
            );
        }

        if plan.has_changes() {
            if let Err(e) = self.store.save(&document) {
                warn!("Failed to persist probe changes: {e}");
                return ItemsChangeResult::all_failed(requested);
            }
            info!("Probe switches changed: {:?}", plan.changes);
        }

        ItemsChangeResult {
            success: plan.report.success.clone(),
            failure: plan.report.failed_names(),
        }
    }
}

/// Usage figure in a plugin snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Figure {
    Percent(f64),
    Bytes(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEntry {
    pub name: &'static str,
    pub current_value: Option<Figure>,
    pub limit_value: Option<Figure>,
}

/// Snapshot of one plugin, recomputed on every query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub plugin_name: String,
    pub is_installed: bool,
    pub status: Option<ServiceState>,
    pub pid: Option<u32>,
    pub collect_items: Vec<CollectItemStatus>,
    pub resource: Vec<ResourceEntry>,
}

/// Resolves plugin names and drives their services.
pub struct PluginManager {
    descriptors: &'static [PluginDescriptor],
    runner: Arc<dyn CommandRunner>,
    services: ServiceController,
    resources: ResourceInspector,
    gopher: GalaGopher,
}

impl PluginManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resources: ResourceInspector,
        gopher_store: ProbeConfigStore,
    ) -> Self {
        Self::with_descriptors(INSTALLABLE_PLUGINS, runner, resources, gopher_store)
    }

    pub fn with_descriptors(
        descriptors: &'static [PluginDescriptor],
        runner: Arc<dyn CommandRunner>,
        resources: ResourceInspector,
        gopher_store: ProbeConfigStore,
    ) -> Self {
        Self {
            descriptors,
            services: ServiceController::new(runner.clone()),
            runner,
            resources,
            gopher: GalaGopher::new(gopher_store),
        }
    }

    pub fn services(&self) -> &ServiceController {
        &self.services
    }

    pub fn descriptors(&self) -> &'static [PluginDescriptor] {
        self.descriptors
    }

    pub fn resolve(&self, name: &str) -> AgentResult<&'static PluginDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AgentError::NotFound(format!("plugin {name}")))
    }

    pub fn is_installed(&self, descriptor: &PluginDescriptor) -> bool {
        self.runner.run("rpm", &["-q", descriptor.rpm_name]).success()
    }

    pub fn installed_plugins(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter(|d| self.is_installed(d))
            .map(|d| d.name.to_string())
            .collect()
    }

    pub fn collector(&self, kind: PluginKind) -> Option<&dyn ProbeCollector> {
        match kind {
            PluginKind::GalaGopher => Some(&self.gopher),
            PluginKind::ServiceOnly => None,
        }
    }

    fn installed(&self, name: &str) -> AgentResult<&'static PluginDescriptor> {
        let descriptor = self.resolve(name)?;
        if !self.is_installed(descriptor) {
            return Err(AgentError::NotInstalled(name.to_string()));
        }
        Ok(descriptor)
    }

    pub fn start_plugin(&self, name: &str) -> AgentResult<()> {
        let descriptor = self.installed(name)?;
        self.services.start(descriptor.service_name)?;
        info!("Plugin {name} started");
        Ok(())
    }

    pub fn stop_plugin(&self, name: &str) -> AgentResult<()> {
        let descriptor = self.installed(name)?;
        self.services.stop(descriptor.service_name)?;
        info!("Plugin {name} stopped");
        Ok(())
    }

    pub fn plugin_info(&self, descriptor: &PluginDescriptor) -> PluginInfo {
        if !self.is_installed(descriptor) {
            return PluginInfo {
                plugin_name: descriptor.name.to_string(),
                is_installed: false,
                status: None,
                pid: None,
                collect_items: Vec::new(),
                resource: Vec::new(),
            };
        }

        let service = descriptor.service_name;
        let status = self.services.status(service);
        let pid = match status {
            ServiceState::Active => self.services.pid(service),
            _ => None,
        };
        let (cpu_current, memory_current) = match pid {
            Some(pid) => (
                self.resources.current_cpu(service, pid).map(Figure::Percent),
                self.resources.current_memory(pid).map(Figure::Bytes),
            ),
            None => (None, None),
        };

        let collect_items = self
            .collector(descriptor.kind)
            .map(|c| c.collect_status())
            .unwrap_or_default();

        PluginInfo {
            plugin_name: descriptor.name.to_string(),
            is_installed: true,
            status: Some(status),
            pid,
            collect_items,
            resource: vec![
                ResourceEntry {
                    name: "cpu",
                    current_value: cpu_current,
                    limit_value: self.resources.cpu_limit(service).map(Figure::Percent),
                },
                ResourceEntry {
                    name: "memory",
                    current_value: memory_current,
                    limit_value: self.resources.memory_limit(service).map(Figure::Bytes),
                },
            ],
        }
    }

    pub fn all_plugin_info(&self) -> Vec<PluginInfo> {
        self.descriptors.iter().map(|d| self.plugin_info(d)).collect()
    }

    /// Switch probes of `plugin`. Plugins that are unknown, not installed or
    /// without collection items reject every requested probe.
    pub fn change_items_status(
        &self,
        plugin: &str,
        requested: &[(String, SwitchMode)],
    ) -> ItemsChangeResult {
        let collector = self
            .installed(plugin)
            .ok()
            .and_then(|d| self.collector(d.kind));
        match collector {
            Some(collector) => collector.change_items_status(requested),
            None => {
                warn!("Plugin {plugin} cannot switch collection items");
                ItemsChangeResult::all_failed(requested)
            }
        }
    }

    /// Probe names of `plugin`, empty when it has none.
    pub fn collect_items(&self, plugin: &str) -> BTreeSet<String> {
        self.resolve(plugin)
            .ok()
            .and_then(|d| self.collector(d.kind))
            .map(|c| c.collect_items())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use std::path::Path;

    const GOPHER_DOC: &str = r#"
[[probes]]
name = "probe1"
command = ""
param = ""
switch = "on"

[[probes]]
name = "probe2"
command = ""
param = ""
switch = "off"

[[extend_probes]]
name = "probe3"
command = ""
param = ""
switch = "off"

[[extend_probes]]
name = "probe4"
command = ""
param = ""
start_check = "mock"
check_type = "count"
switch = "auto"
"#;

    const STATUS_ACTIVE: &str =
        "     Active: active (running) since Tue 2023-07-04 09:00:00 CST; 5min ago\n   Main PID: 749 (gala-gopher)\n";

    fn requested(entries: &[(&str, SwitchMode)]) -> Vec<(String, SwitchMode)> {
        entries.iter().map(|(n, m)| (n.to_string(), *m)).collect()
    }

    fn manager(runner: ScriptedRunner, config: &Path, proc_root: &Path) -> (PluginManager, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let resources = ResourceInspector::with_proc_root(runner.clone(), proc_root);
        let manager = PluginManager::new(runner.clone(), resources, ProbeConfigStore::new(config));
        (manager, runner)
    }

    fn gopher_with(doc: Option<&str>) -> (GalaGopher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gala-gopher.conf");
        if let Some(doc) = doc {
            std::fs::write(&path, doc).unwrap();
        }
        (GalaGopher::new(ProbeConfigStore::new(path)), dir)
    }

    #[test]
    fn test_collect_status_lists_both_groups() {
        let (gopher, _dir) = gopher_with(Some(GOPHER_DOC));
        let status = gopher.collect_status();
        let expected = vec![
            CollectItemStatus { probe_name: "probe1".into(), probe_status: SwitchMode::On, support_auto: false },
            CollectItemStatus { probe_name: "probe2".into(), probe_status: SwitchMode::Off, support_auto: false },
            CollectItemStatus { probe_name: "probe3".into(), probe_status: SwitchMode::Off, support_auto: false },
            CollectItemStatus { probe_name: "probe4".into(), probe_status: SwitchMode::Auto, support_auto: true },
        ];
        assert_eq!(status, expected);
    }

    #[test]
    fn test_collect_status_empty_when_config_missing() {
        let (gopher, _dir) = gopher_with(None);
        assert!(gopher.collect_status().is_empty());
    }

    #[test]
    fn test_collect_items_is_set_across_groups() {
        let (gopher, _dir) = gopher_with(Some(GOPHER_DOC));
        let expected: BTreeSet<String> =
            ["probe1", "probe2", "probe3", "probe4"].iter().map(|s| s.to_string()).collect();
        assert_eq!(gopher.collect_items(), expected);
    }

    #[test]
    fn test_collect_items_empty_when_config_missing() {
        let (gopher, _dir) = gopher_with(None);
        assert!(gopher.collect_items().is_empty());
    }

    #[test]
    fn test_change_items_all_fail_when_config_missing() {
        let (gopher, dir) = gopher_with(None);
        let result = gopher.change_items_status(&requested(&[
            ("mock_probe1", SwitchMode::On),
            ("mock_probe2", SwitchMode::Off),
            ("mock_probe3", SwitchMode::Auto),
        ]));
        assert!(result.success.is_empty());
        assert_eq!(result.failure, ["mock_probe1", "mock_probe2", "mock_probe3"]);
        assert!(!dir.path().join("gala-gopher.conf").exists());
    }

    #[test]
    fn test_change_items_partial_success_is_persisted() {
        let (gopher, dir) = gopher_with(Some(GOPHER_DOC));
        let result = gopher.change_items_status(&requested(&[
            ("probe1", SwitchMode::Off),
            ("mock_incorrect_probe", SwitchMode::Auto),
            ("probe2", SwitchMode::Auto),
            ("probe4", SwitchMode::On),
        ]));
        assert_eq!(result.success, ["probe1", "probe4"]);
        assert_eq!(result.failure, ["mock_incorrect_probe", "probe2"]);

        let reloaded = ProbeConfigStore::new(dir.path().join("gala-gopher.conf")).load();
        assert_eq!(reloaded.get("probe1").unwrap().switch(), SwitchMode::Off);
        assert_eq!(reloaded.get("probe2").unwrap().switch(), SwitchMode::Off);
        assert_eq!(reloaded.get("probe4").unwrap().switch(), SwitchMode::On);
    }

    #[test]
    fn test_change_items_all_failed_writes_nothing() {
        let (gopher, dir) = gopher_with(Some(GOPHER_DOC));
        let path = dir.path().join("gala-gopher.conf");
        let result = gopher.change_items_status(&requested(&[("probe1", SwitchMode::Auto)]));
        assert!(result.success.is_empty());
        assert_eq!(result.failure, ["probe1"]);
        assert_eq!(std::fs::read_to_string(path).unwrap(), GOPHER_DOC);
    }

    #[test]
    fn test_change_items_save_failure_fails_every_name() {
        let dir = tempfile::tempdir().unwrap();
        // No room beside a name this long for the temporary file.
        let path = dir.path().join("c".repeat(250));
        std::fs::write(&path, GOPHER_DOC).unwrap();
        let gopher = GalaGopher::new(ProbeConfigStore::new(&path));

        let result = gopher.change_items_status(&requested(&[
            ("probe1", SwitchMode::Off),
            ("ghost", SwitchMode::On),
            ("probe4", SwitchMode::On),
        ]));

        assert!(result.success.is_empty());
        assert_eq!(result.failure, ["probe1", "ghost", "probe4"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), GOPHER_DOC);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_manager_collect_items_per_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("gala-gopher.conf");
        std::fs::write(&config, GOPHER_DOC).unwrap();
        let (mgr, runner) = manager(ScriptedRunner::new(), &config, dir.path());

        let items = mgr.collect_items("gala-gopher");
        assert_eq!(items.len(), 4);
        assert!(items.contains("probe3"));
        assert!(mgr.collect_items("gala-spider").is_empty());
        assert!(mgr.collect_items("nginx").is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_installed_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .on("rpm -q gala-gopher", 0, "gala-gopher-1.0.2-1.x86_64")
            .on("rpm -q gala-spider", 1, "package gala-spider is not installed");
        let (mgr, _) = manager(runner, &dir.path().join("c"), dir.path());
        assert_eq!(mgr.installed_plugins(), ["gala-gopher"]);
    }

    #[test]
    fn test_start_unknown_plugin_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, runner) = manager(ScriptedRunner::new(), &dir.path().join("c"), dir.path());
        let err = mgr.start_plugin("nginx").unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_start_uninstalled_plugin_never_touches_systemctl() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, runner) = manager(
            ScriptedRunner::new().on("rpm -q", 1, ""),
            &dir.path().join("c"),
            dir.path(),
        );
        let err = mgr.start_plugin("gala-gopher").unwrap_err();
        assert!(matches!(err, AgentError::NotInstalled(_)));
        let err = mgr.stop_plugin("gala-gopher").unwrap_err();
        assert!(matches!(err, AgentError::NotInstalled(_)));
        assert_eq!(runner.count("systemctl"), 0);
    }

    #[test]
    fn test_start_installed_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, runner) = manager(
            ScriptedRunner::new()
                .on("rpm -q", 0, "")
                .on("systemctl status", 3, "Active: inactive (dead)")
                .on("systemctl start", 0, ""),
            &dir.path().join("c"),
            dir.path(),
        );
        assert!(mgr.start_plugin("gala-gopher").is_ok());
        assert_eq!(runner.count("systemctl start gala-gopher"), 1);
    }

    #[test]
    fn test_stop_failure_maps_to_command_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(
            ScriptedRunner::new()
                .on("rpm -q", 0, "")
                .on("systemctl status", 0, STATUS_ACTIVE)
                .on("systemctl stop", 1, ""),
            &dir.path().join("c"),
            dir.path(),
        );
        let err = mgr.stop_plugin("gala-gopher").unwrap_err();
        assert!(matches!(err, AgentError::CommandFailed(_)));
    }

    #[test]
    fn test_info_for_running_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("gala-gopher.conf");
        std::fs::write(&config, GOPHER_DOC).unwrap();
        std::fs::create_dir_all(dir.path().join("749")).unwrap();
        std::fs::write(dir.path().join("749/status"), "VmRSS:\t 2048 kB\n").unwrap();

        let (mgr, _) = manager(
            ScriptedRunner::new()
                .on("rpm -q", 0, "")
                .on("systemctl status", 0, STATUS_ACTIVE)
                .on("systemctl show gala-gopher -p CPUQuotaPerSecUSec", 0, "CPUQuotaPerSecUSec=1s")
                .on("systemctl show gala-gopher -p MemoryHigh", 0, "MemoryHigh=104857600")
                .on("ps", 0, "3.0"),
            &config,
            dir.path(),
        );

        let info = mgr.plugin_info(mgr.resolve("gala-gopher").unwrap());
        assert!(info.is_installed);
        assert_eq!(info.status, Some(ServiceState::Active));
        assert_eq!(info.pid, Some(749));
        assert_eq!(info.collect_items.len(), 4);
        assert_eq!(info.resource[0].name, "cpu");
        assert_eq!(info.resource[0].current_value, Some(Figure::Percent(3.0)));
        assert_eq!(info.resource[0].limit_value, Some(Figure::Percent(100.0)));
        assert_eq!(info.resource[1].current_value, Some(Figure::Bytes(2048 * 1024)));
        assert_eq!(info.resource[1].limit_value, Some(Figure::Bytes(104_857_600)));
    }

    #[test]
    fn test_info_nulls_current_usage_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, runner) = manager(
            ScriptedRunner::new()
                .on("rpm -q", 0, "")
                .on("systemctl status", 3, "Active: inactive (dead)")
                .on("systemctl show", 0, "CPUQuotaPerSecUSec=infinity"),
            &dir.path().join("missing.conf"),
            dir.path(),
        );

        let info = mgr.plugin_info(mgr.resolve("gala-spider").unwrap());
        assert_eq!(info.status, Some(ServiceState::Inactive));
        assert!(info.collect_items.is_empty());
        assert!(info.resource.iter().all(|r| r.current_value.is_none()));
        assert_eq!(runner.count("ps"), 0);
    }

    #[test]
    fn test_info_for_uninstalled_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(ScriptedRunner::new().on("rpm -q", 1, ""), &dir.path().join("c"), dir.path());
        let infos = mgr.all_plugin_info();
        assert_eq!(infos.len(), INSTALLABLE_PLUGINS.len());
        assert!(infos.iter().all(|i| !i.is_installed && i.status.is_none() && i.resource.is_empty()));
    }

    #[test]
    fn test_change_items_on_service_only_plugin_fails_all() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(ScriptedRunner::new().on("rpm -q", 0, ""), &dir.path().join("c"), dir.path());
        let result = mgr.change_items_status("gala-spider", &requested(&[("probe1", SwitchMode::On)]));
        assert!(result.success.is_empty());
        assert_eq!(result.failure, ["probe1"]);
    }

    #[test]
    fn test_all_failed_dedups_names() {
        let result = ItemsChangeResult::all_failed(&requested(&[
            ("p1", SwitchMode::On),
            ("p1", SwitchMode::Off),
        ]));
        assert_eq!(result.failure, ["p1"]);
    }
}

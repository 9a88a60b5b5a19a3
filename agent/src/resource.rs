//! Resource limits and live consumption of a service's main process
//!
//! Limits come from the unit's resource-control properties; live figures
//! from `ps` and `/proc/<pid>/status`. Every reader returns `None` when the
//! value is unset, unbounded or could not be read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::command::CommandRunner;

const UNBOUNDED: &str = "infinity";

/// Reads configured limits and current usage for a service.
#[derive(Clone)]
pub struct ResourceInspector {
    runner: Arc<dyn CommandRunner>,
    proc_root: PathBuf,
}

impl ResourceInspector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_proc_root(runner, "/proc")
    }

    pub fn with_proc_root(runner: Arc<dyn CommandRunner>, proc_root: impl AsRef<Path>) -> Self {
        Self {
            runner,
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }

    fn show_property(&self, service: &str, property: &str) -> Option<String> {
        let output = self
            .runner
            .run("systemctl", &["show", service, "-p", property]);
        if !output.success() {
            warn!("systemctl show {service} -p {property} failed ({})", output.exit_code);
            return None;
        }
        let prefix = format!("{property}=");
        output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix(prefix.as_str()))
            .map(|value| value.trim().to_string())
    }

    /// CPU quota as a percentage of one core, `None` when unbounded.
    pub fn cpu_limit(&self, service: &str) -> Option<f64> {
        let value = self.show_property(service, "CPUQuotaPerSecUSec")?;
        parse_timespan_usec(&value).map(|usec| usec as f64 / 10_000.0)
    }

    /// Memory ceiling in bytes (`MemoryHigh`, else `MemoryMax`), `None` when unbounded.
    pub fn memory_limit(&self, service: &str) -> Option<u64> {
        ["MemoryHigh", "MemoryMax"]
            .iter()
            .find_map(|property| parse_bytes_limit(&self.show_property(service, property)?))
    }

    /// CPU usage of `pid` in percent.
    pub fn current_cpu(&self, service: &str, pid: u32) -> Option<f64> {
        let pid = pid.to_string();
        let output = self.runner.run("ps", &["-o", "%cpu=", "-p", &pid]);
        if !output.success() {
            warn!("ps for {service} (pid {pid}) failed ({})", output.exit_code);
            return None;
        }
        let percent = output.stdout.trim().parse::<f64>().ok();
        debug!("{service} (pid {pid}) cpu: {percent:?}");
        percent
    }

    /// Resident set size of `pid` in bytes.
    pub fn current_memory(&self, pid: u32) -> Option<u64> {
        let path = self.proc_root.join(pid.to_string()).join("status");
        match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .find_map(|line| extract_status_kb(line, "VmRSS"))
                .map(|kb| kb * 1024),
            Err(e) => {
                warn!("Failed to read {}: {e}", path.display());
                None
            }
        }
    }
}

/// Parse a systemd timespan such as `1s`, `500ms` or `1.500000s` into
/// microseconds.
pub fn parse_timespan_usec(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || value == UNBOUNDED {
        return None;
    }

    let mut total = 0f64;
    for part in value.split_whitespace() {
        let split = part
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(part.len());
        let (number, unit) = part.split_at(split);
        let number: f64 = number.parse().ok()?;
        let scale = match unit {
            "us" | "usec" => 1.0,
            "ms" | "msec" => 1_000.0,
            "" | "s" | "sec" => 1_000_000.0,
            "min" | "m" => 60_000_000.0,
            _ => return None,
        };
        total += number * scale;
    }
    Some(total.round() as u64)
}

/// Parse a byte limit; `infinity`, empty and `0` all mean unbounded.
pub fn parse_bytes_limit(value: &str) -> Option<u64> {
    let value = value.trim();
    if value == UNBOUNDED {
        return None;
    }
    value.parse::<u64>().ok().filter(|&bytes| bytes > 0)
}

fn extract_status_kb(line: &str, key: &str) -> Option<u64> {
    // Format: "VmRSS:     12345 kB"
    let rest = line.strip_prefix(key)?.strip_prefix(':')?;
    rest.split_whitespace().next()?.parse::<u64>().ok()
}

//! Host information: OS, CPU, memory and disks
//!
//! Each section is read independently. A reader that fails leaves its own
//! fields empty without affecting the other sections.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::command::CommandRunner;
use crate::error::{AgentError, AgentResult};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    Os,
    Cpu,
    Memory,
    Disk,
}

impl InfoKind {
    pub const ALL: [InfoKind; 4] = [InfoKind::Os, InfoKind::Cpu, InfoKind::Memory, InfoKind::Disk];

    pub fn as_str(self) -> &'static str {
        match self {
            InfoKind::Os => "os",
            InfoKind::Cpu => "cpu",
            InfoKind::Memory => "memory",
            InfoKind::Disk => "disk",
        }
    }

    /// Parse a requested kind list. Empty means every kind; any unknown
    /// entry rejects the whole request.
    pub fn parse_list<S: AsRef<str>>(requested: &[S]) -> AgentResult<Vec<InfoKind>> {
        if requested.is_empty() {
            return Ok(Self::ALL.to_vec());
        }
        let mut kinds = Vec::new();
        for item in requested {
            let kind: InfoKind = item.as_ref().parse().map_err(AgentError::ParamInvalid)?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

impl fmt::Display for InfoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InfoKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "os" => Ok(InfoKind::Os),
            "cpu" => Ok(InfoKind::Cpu),
            "memory" => Ok(InfoKind::Memory),
            "disk" => Ok(InfoKind::Disk),
            other => Err(format!("unknown info type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OsInfo {
    pub os_version: String,
    pub bios_version: String,
    pub kernel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuInfo {
    pub architecture: String,
    pub core_count: String,
    pub model_name: String,
    pub vendor_id: String,
    pub l1d_cache: String,
    pub l1i_cache: String,
    pub l2_cache: String,
    pub l3_cache: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryDevice {
    pub size: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub speed: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub size: String,
    pub total: u64,
    pub info: Vec<MemoryDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskInfo {
    pub capacity: String,
    pub model: String,
}

/// Requested sections only; absent ones are omitted from the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<Vec<DiskInfo>>,
}

pub struct HostInspector {
    runner: Arc<dyn CommandRunner>,
    os_release: PathBuf,
    meminfo: PathBuf,
}

impl HostInspector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            os_release: PathBuf::from("/etc/os-release"),
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }

    pub fn with_paths(
        runner: Arc<dyn CommandRunner>,
        os_release: impl Into<PathBuf>,
        meminfo: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            os_release: os_release.into(),
            meminfo: meminfo.into(),
        }
    }

    pub fn host_info(&self, kinds: &[InfoKind]) -> HostInfo {
        let mut info = HostInfo::default();
        for kind in kinds {
            match kind {
                InfoKind::Os => info.os = Some(self.os()),
                InfoKind::Cpu => info.cpu = Some(self.cpu()),
                InfoKind::Memory => info.memory = Some(self.memory()),
                InfoKind::Disk => info.disk = Some(self.disks()),
            }
        }
        info
    }

    fn stdout_of(&self, program: &str, args: &[&str]) -> Option<String> {
        let output = self.runner.run(program, args);
        if output.success() {
            Some(output.stdout)
        } else {
            warn!("{program} {} failed ({})", args.join(" "), output.exit_code);
            None
        }
    }

    fn read(&self, path: &std::path::Path) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                warn!("Failed to read {}: {e}", path.display());
                None
            }
        }
    }

    pub fn os(&self) -> OsInfo {
        OsInfo {
            os_version: self
                .read(&self.os_release)
                .and_then(|c| parse_os_release(&c))
                .unwrap_or_default(),
            bios_version: self
                .stdout_of("dmidecode", &["-s", "bios-version"])
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            kernel: self
                .stdout_of("uname", &["-r"])
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn cpu(&self) -> CpuInfo {
        self.stdout_of("lscpu", &[])
            .map(|out| parse_lscpu(&out))
            .unwrap_or_default()
    }

    pub fn memory(&self) -> MemoryInfo {
        let total = self
            .read(&self.meminfo)
            .and_then(|c| parse_meminfo_total(&c))
            .unwrap_or(0);
        let info = self
            .stdout_of("dmidecode", &["-t", "memory"])
            .map(|out| parse_dmidecode_memory(&out))
            .unwrap_or_default();
        MemoryInfo {
            size: if total > 0 { gigabytes(total) } else { String::new() },
            total,
            info,
        }
    }

    pub fn disks(&self) -> Vec<DiskInfo> {
        self.stdout_of("lsblk", &["-d", "-b", "-n", "-P", "-o", "NAME,SIZE,MODEL,TYPE"])
            .map(|out| parse_lsblk(&out))
            .unwrap_or_default()
    }
}

fn gigabytes(bytes: u64) -> String {
    format!("{} GB", (bytes + GIB / 2) / GIB)
}

/// `PRETTY_NAME` from an os-release file, unquoted.
pub fn parse_os_release(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim().trim_matches('"').to_string())
    })
}

pub fn parse_lscpu(output: &str) -> CpuInfo {
    let mut cpu = CpuInfo::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        let slot = match key.trim() {
            "Architecture" => &mut cpu.architecture,
            "CPU(s)" => &mut cpu.core_count,
            "Model name" => &mut cpu.model_name,
            "Vendor ID" => &mut cpu.vendor_id,
            "L1d cache" => &mut cpu.l1d_cache,
            "L1i cache" => &mut cpu.l1i_cache,
            "L2 cache" => &mut cpu.l2_cache,
            "L3 cache" => &mut cpu.l3_cache,
            _ => continue,
        };
        if slot.is_empty() {
            *slot = value;
        }
    }
    cpu
}

/// `MemTotal` in bytes.
pub fn parse_meminfo_total(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

/// Populated DIMMs from `dmidecode -t memory`.
pub fn parse_dmidecode_memory(output: &str) -> Vec<MemoryDevice> {
    let mut devices = Vec::new();
    let mut current: Option<MemoryDevice> = None;

    for line in output.lines() {
        if line.trim() == "Memory Device" {
            devices.extend(current.take());
            current = Some(MemoryDevice::default());
            continue;
        }
        // Section headers start at column 0 and end the current device.
        if !line.starts_with(char::is_whitespace) {
            devices.extend(current.take());
            continue;
        }
        let Some(device) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key {
            "Size" => device.size = value,
            "Type" => device.kind = value,
            "Speed" => device.speed = value,
            "Manufacturer" => device.manufacturer = value,
            _ => {}
        }
    }
    devices.extend(current);

    devices.retain(|d| !d.size.is_empty() && !d.size.starts_with("No Module"));
    devices
}

/// Whole disks from `lsblk -P` key/value output.
pub fn parse_lsblk(output: &str) -> Vec<DiskInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields = parse_pairs(line);
            let field = |key: &str| {
                fields
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.as_str())
            };
            if field("TYPE")? != "disk" {
                return None;
            }
            let size: u64 = field("SIZE")?.parse().ok()?;
            Some(DiskInfo {
                capacity: gigabytes(size),
                model: field("MODEL").unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}

fn parse_pairs(line: &str) -> Vec<(&str, String)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while let Some((key, after)) = rest.split_once("=\"") {
        let Some(end) = after.find('"') else {
            break;
        };
        pairs.push((key.trim(), after[..end].to_string()));
        rest = &after[end + 1..];
    }
    pairs
}

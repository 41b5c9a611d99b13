use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const POWERSHELL: &str = "powershell -NoProfile -NonInteractive -Command";

/// Directory holding the daemon's files, `%ProgramData%\vmwake` on Windows.
pub fn default_dir() -> PathBuf {
    if cfg!(windows) {
        let program_data = std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        PathBuf::from(program_data).join("vmwake")
    } else {
        PathBuf::from("/etc/vmwake")
    }
}

pub fn default_config_path() -> PathBuf {
    default_dir().join("config.yml")
}

fn default_registry_path() -> String {
    if cfg!(windows) {
        default_dir().join("registry.json").to_string_lossy().into_owned()
    } else {
        "/var/lib/vmwake/registry.json".to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Seconds to wait for the registry before giving up.
    pub readiness_timeout: u64,
    /// Seconds during which repeated packets for a woken MAC are dropped.
    pub cooldown: u64,
    pub poll_interval_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: 10,
            cooldown: 5,
            poll_interval_ms: 250,
        }
    }
}

impl ListenerConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Command templates run against the hypervisor. `{name}` is replaced by the
/// VM name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub list_vms: String,
    pub adapter_mac: String,
    pub power_on: String,
    /// Seconds allowed for each inventory command.
    pub timeout: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            list_vms: format!("{} \"Get-VM | Select-Object -ExpandProperty Name\"", POWERSHELL),
            adapter_mac: format!("{} \"(Get-VMNetworkAdapter -VMName '{{name}}').MacAddress\"", POWERSHELL),
            power_on: format!("{} \"Start-VM -Name '{{name}}'\"", POWERSHELL),
            timeout: 60,
        }
    }
}

impl HypervisorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry_path: String,
    pub listener: ListenerConfig,
    pub hypervisor: HypervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            listener: ListenerConfig::default(),
            hypervisor: HypervisorConfig::default(),
        }
    }
}

impl Config {
    /// Loads the YAML config at `path`. A missing file is only tolerated when
    /// `required` is false, in which case defaults apply.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        if !required && !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Registry location with `~` and environment variables expanded.
    pub fn registry_path(&self) -> Result<PathBuf> {
        expand_path(&self.registry_path)
    }
}

pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path).with_context(|| format!("cannot expand path '{}'", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use nettracer_bpf::kallsyms::DEFAULT_KALLSYMS_PATH;

pub const DEFAULT_OBJECT_PATH: &str = "/usr/share/nettracer/bpf/socketenricher.bpf.o";
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EnricherConfig {
    /// Compiled socket enricher BPF object
    pub object: PathBuf,
    /// Where to resolve kernel symbol addresses from
    pub kallsyms: PathBuf,
    /// How often deleted sockets are swept from the map.
    ///
    /// Format: duration string (e.g., "2s", "500ms")
    /// Default: 2s
    pub sweep_interval: Option<String>,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            object: PathBuf::from(DEFAULT_OBJECT_PATH),
            kallsyms: PathBuf::from(DEFAULT_KALLSYMS_PATH),
            sweep_interval: None,
        }
    }
}

impl EnricherConfig {
    pub fn sweep_interval(&self) -> Result<Duration> {
        let Some(interval) = self.sweep_interval.as_deref() else {
            return Ok(DEFAULT_SWEEP_INTERVAL);
        };

        let interval = humantime::parse_duration(interval.trim()).with_context(|| {
            format!("Invalid sweep interval: '{interval}'. Expected format like '2s' or '500ms'")
        })?;
        if interval.is_zero() {
            anyhow::bail!("Sweep interval must be greater than zero");
        }
        Ok(interval)
    }
}

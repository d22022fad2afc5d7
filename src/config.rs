use crate::prelude::*;
use serde::{Deserialize, Serialize};
use socket_enricher::EnricherConfig;
use std::fs;
use std::path::Path;

pub const DEFAULT_PROGRAM: &str = "ig_trace_net";
pub const DEFAULT_PERF_MAP: &str = "events";

/// Tracer configuration, usually read from a YAML file.
///
/// Every key is optional, missing keys keep their default value:
///
/// ```yaml
/// program: ig_trace_dns
/// perf-map: events
/// socket-attach: 50 # SO_ATTACH_BPF
/// perf-buffer-pages: 64
/// require-enrichment: false
/// enricher:
///   object: /usr/share/nettracer/bpf/socketenricher.bpf.o
///   sweep-interval: 2s
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TracerConfig {
    /// Entry program attached to each raw socket
    pub program: String,
    /// Perf event array the entry program writes to
    pub perf_map: String,
    /// Socket option used to attach the entry program
    pub socket_attach: i32,
    /// Pages per CPU buffer, must be a power of two
    pub perf_buffer_pages: usize,
    /// Fail instead of tracing without socket enrichment when the enricher can't be started
    pub require_enrichment: bool,
    pub enricher: EnricherConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_owned(),
            perf_map: DEFAULT_PERF_MAP.to_owned(),
            socket_attach: libc::SO_ATTACH_BPF,
            perf_buffer_pages: nettracer_bpf::PERF_BUFFER_PAGES,
            require_enrichment: false,
            enricher: EnricherConfig::default(),
        }
    }
}

impl TracerConfig {
    /// Load the configuration. If it does not exist, return a default configuration.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = match fs::read(config_path) {
            Ok(config_str) => {
                let config: TracerConfig = serde_yaml::from_slice(&config_str).context(
                    format!("Failed to parse tracer config at {}", config_path.display()),
                )?;
                debug!("Config loaded from {}", config_path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file not found at {}", config_path.display());
                TracerConfig::default()
            }
            Err(e) => bail!("Failed to load config: {e}"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.program.is_empty(), "program must not be empty");
        ensure!(!self.perf_map.is_empty(), "perf-map must not be empty");
        ensure!(
            self.perf_buffer_pages.is_power_of_two(),
            "perf-buffer-pages must be a power of two, got {}",
            self.perf_buffer_pages
        );
        self.enricher.sweep_interval()?;
        Ok(())
    }
}

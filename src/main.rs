use clap::Parser;
use nettracer::prelude::*;
use nettracer::{Status, Tracer, TracerConfig};
use nettracer_bpf::ObjectTemplate;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "nettracer")]
#[command(version, about = "Trace the network traffic of processes using eBPF", long_about = None)]
struct Cli {
    /// Compiled BPF object holding the socket program
    #[arg(long)]
    object: PathBuf,

    /// Tracer configuration file
    #[arg(short, long, env = "NETTRACER_CONFIG", default_value = "/etc/nettracer/config.yaml")]
    config: PathBuf,

    /// Socket program to attach, overrides the configuration
    #[arg(long)]
    program: Option<String>,

    /// Perf event array the program writes to, overrides the configuration
    #[arg(long)]
    perf_map: Option<String>,

    /// Fail if the socket enricher can't be started
    #[arg(long)]
    require_enrichment: bool,

    /// How long to trace for (e.g., "30s", "5m")
    #[arg(short, long, default_value = "10s", value_parser = parse_duration)]
    duration: Duration,

    /// Pids whose network namespaces are traced
    #[arg(required = true)]
    pids: Vec<u32>,
}

#[derive(Debug)]
enum CliEvent {
    Status(Status),
    Sample { netns: u64, len: usize },
}

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

fn main() -> Result<()> {
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("NETTRACER_LOG", "info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    let mut config = TracerConfig::load(&cli.config)?;
    if let Some(program) = cli.program {
        config.program = program;
    }
    if let Some(perf_map) = cli.perf_map {
        config.perf_map = perf_map;
    }
    config.require_enrichment |= cli.require_enrichment;
    config.validate()?;

    nettracer_bpf::bump_memlock_rlimit()?;

    let template = ObjectTemplate::from_file(&cli.object)?;
    let mut tracer = Tracer::new(template, &config, CliEvent::Status, |raw, netns| {
        Ok(Some(CliEvent::Sample {
            netns,
            len: raw.len(),
        }))
    })?;

    for pid in &cli.pids {
        tracer
            .attach(*pid, log_event)
            .with_context(|| format!("Failed to attach pid {pid}"))?;
        info!("Tracing pid {pid}");
    }

    std::thread::sleep(cli.duration);

    for pid in &cli.pids {
        if let Err(err) = tracer.detach(*pid) {
            warn!("{err}");
        }
    }
    tracer.close();
    info!("Tracer closed");
    Ok(())
}

fn log_event(event: CliEvent) {
    match event {
        CliEvent::Status(status) => warn!("{status}"),
        CliEvent::Sample { netns, len } => info!("netns {netns}: {len} bytes"),
    }
}

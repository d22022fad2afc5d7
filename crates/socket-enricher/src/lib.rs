//! Socket enricher
//!
//! Maintains a kernel map of socket → owning process so that network programs can attribute
//! traffic to processes directly from BPF. The map is populated by kprobes on the bind, connect,
//! send and release paths, seeded with already-open sockets by an iterator at start, and swept
//! periodically by a second iterator that evicts entries of destroyed sockets.

pub mod config;
pub mod ebpf;
pub mod enricher;
pub mod probes;

pub use config::EnricherConfig;
pub use ebpf::{CleanupIter, KernelProbes};
pub use enricher::{EnricherProbes, SocketEnricher, Sweeper};
pub use probes::{SocketProbes, attach_socket_probes};

/// Name of the socket → process map shared with other programs
pub const SOCKETS_MAP_NAME: &str = "sockets";

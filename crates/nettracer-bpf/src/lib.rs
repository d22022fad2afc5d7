//! Shared BPF utilities for the nettracer crates
//!
//! This crate provides the libbpf plumbing shared by the tracer and the socket enricher:
//! - Object templates with per-load constant rewriting and map replacement
//! - Perf buffer readers split into a blocking read half and a close half
//! - Kernel symbol resolution
//! - Probe attachment macros

pub mod collection;
pub mod kallsyms;
pub mod macros;
pub mod perf;
pub mod probes;
pub mod rlimit;

pub use collection::{LoadedObject, ObjectSpec, ObjectTemplate};
pub use perf::{PerfReader, ReadError, ReaderHandle, Record};
pub use probes::ProbeSet;
pub use rlimit::bump_memlock_rlimit;

#[doc(hidden)]
pub use paste;

/// Number of pages backing each per-CPU perf buffer.
pub const PERF_BUFFER_PAGES: usize = 64;

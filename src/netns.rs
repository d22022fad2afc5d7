use crate::prelude::*;
use procfs::process::{Namespace, Process};
use std::ffi::OsStr;

/// The network namespace entry of `pid`, as listed under `/proc/<pid>/ns`
pub fn net_namespace(pid: u32) -> Result<Namespace> {
    let process = Process::new(pid as _).with_context(|| format!("No such process: {pid}"))?;
    let mut namespaces = process
        .namespaces()
        .with_context(|| format!("Failed to list the namespaces of pid {pid}"))?;
    namespaces
        .0
        .remove(OsStr::new("net"))
        .with_context(|| format!("pid {pid} has no network namespace"))
}

/// Inode number identifying the network namespace of `pid`.
///
/// Processes sharing a network namespace resolve to the same inode.
pub fn netns_inode(pid: u32) -> Result<u64> {
    Ok(u64::from(net_namespace(pid)?.identifier))
}

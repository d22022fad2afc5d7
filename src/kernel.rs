//! Kernel operations the tracer relies on
//!
//! [`LibbpfKernel`] is the real thing. The [`Kernel`] and [`Collection`] traits exist so that the
//! attachment lifecycle can be driven without privileges.

use crate::prelude::*;
use crate::{netns, rawsock};
use nettracer_bpf::{LoadedObject, ObjectSpec, PerfReader, ReaderHandle};
use socket_enricher::{EnricherConfig, EnricherProbes, KernelProbes, SocketEnricher};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// A loaded program/map set. Dropping it releases every program and map.
pub trait Collection {
    /// Open a reader over the perf event array `map`, with `pages` pages per CPU
    fn open_reader(&self, map: &str, pages: usize) -> Result<(ReaderHandle, PerfReader)>;

    /// Duplicate the file descriptor of program `name`, if the set has it
    fn program_fd(&self, name: &str) -> Result<Option<OwnedFd>>;
}

pub trait Kernel {
    type Collection: Collection;
    type Socket: AsFd;
    type Probes: EnricherProbes;

    /// Inode of the network namespace of `pid`
    fn netns_of(&self, pid: u32) -> Result<u64>;

    fn load(&self, spec: &ObjectSpec<'_>) -> Result<Self::Collection>;

    /// Open a raw socket in the network namespace of `pid`
    fn open_raw_socket(&self, pid: u32) -> Result<Self::Socket>;

    fn attach_socket_program(
        &self,
        socket: BorrowedFd<'_>,
        option: i32,
        program: BorrowedFd<'_>,
    ) -> Result<()>;

    fn start_enricher(&self, config: &EnricherConfig) -> Result<SocketEnricher<Self::Probes>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LibbpfKernel;

impl Collection for LoadedObject {
    fn open_reader(&self, map: &str, pages: usize) -> Result<(ReaderHandle, PerfReader)> {
        self.open_perf_reader(map, pages)
    }

    fn program_fd(&self, name: &str) -> Result<Option<OwnedFd>> {
        LoadedObject::program_fd(self, name)
    }
}

impl Kernel for LibbpfKernel {
    type Collection = LoadedObject;
    type Socket = OwnedFd;
    type Probes = KernelProbes;

    fn netns_of(&self, pid: u32) -> Result<u64> {
        netns::netns_inode(pid)
    }

    fn load(&self, spec: &ObjectSpec<'_>) -> Result<LoadedObject> {
        spec.load()
    }

    fn open_raw_socket(&self, pid: u32) -> Result<OwnedFd> {
        rawsock::open_raw_socket(pid)
    }

    fn attach_socket_program(
        &self,
        socket: BorrowedFd<'_>,
        option: i32,
        program: BorrowedFd<'_>,
    ) -> Result<()> {
        rawsock::attach_program(socket, option, program)
    }

    fn start_enricher(&self, config: &EnricherConfig) -> Result<SocketEnricher<KernelProbes>> {
        SocketEnricher::new(config)
    }
}

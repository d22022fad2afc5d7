use anyhow::{Context, Result, anyhow};
use libbpf_rs::{Iter, Link};
use log::{debug, warn};
use nettracer_bpf::{LoadedObject, ObjectTemplate, ProbeSet, kallsyms};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use crate::SOCKETS_MAP_NAME;
use crate::config::EnricherConfig;
use crate::enricher::{EnricherProbes, Sweeper};

const SOCKET_FILE_OPS: &str = "socket_file_ops";
const SOCKET_FILE_OPS_ADDR: &str = "socket_file_ops_addr";

/// libbpf-backed socket enricher programs
pub struct KernelProbes {
    // Released before the object, in attach order
    links: Vec<Link>,
    cleanup_link: Option<usize>,
    object: Option<LoadedObject>,
}

impl KernelProbes {
    /// Load the socket enricher object, patched with the address of `socket_file_ops`
    pub fn load(config: &EnricherConfig) -> Result<Self> {
        let template = ObjectTemplate::from_file(&config.object).context("loading asset")?;

        let addresses = kallsyms::resolve_addresses(&config.kallsyms, &[SOCKET_FILE_OPS])?;
        let mut spec = template.copy();
        spec.rewrite_constant(
            SOCKET_FILE_OPS_ADDR,
            &addresses[SOCKET_FILE_OPS].to_ne_bytes(),
        )?;

        let object = spec.load().context("loading ebpf program")?;
        Ok(Self {
            links: Vec::new(),
            cleanup_link: None,
            object: Some(object),
        })
    }

    fn object_mut(&mut self) -> Result<&mut LoadedObject> {
        self.object
            .as_mut()
            .ok_or_else(|| anyhow!("socket enricher programs have been released"))
    }
}

impl ProbeSet for KernelProbes {
    fn attach_kprobe(&mut self, program: &str, function: &str, retprobe: bool) -> Result<()> {
        let link = self
            .object_mut()?
            .attach_kprobe(program, function, retprobe)?;
        self.links.push(link);
        Ok(())
    }

    fn run_iterator(&mut self, program: &str) -> Result<()> {
        let link = self
            .object_mut()?
            .attach_iter(program, None)
            .context("attach BPF iterator")?;
        let mut iter = Iter::new(&link).context("open BPF iterator")?;
        io::copy(&mut iter, &mut io::sink()).context("read BPF iterator")?;
        Ok(())
    }

    fn attach_map_iterator(&mut self, program: &str, map: &str) -> Result<()> {
        let object = self.object_mut()?;
        let map_fd = object.map_fd(map)?;
        let link = object
            .attach_iter(program, Some(map_fd.as_fd()))
            .context("attach BPF iterator for cleanups")?;

        self.cleanup_link = Some(self.links.len());
        self.links.push(link);
        Ok(())
    }
}

impl EnricherProbes for KernelProbes {
    type Sweeper = CleanupIter;

    fn sockets_map(&self) -> Result<OwnedFd> {
        self.object
            .as_ref()
            .ok_or_else(|| anyhow!("socket enricher programs have been released"))?
            .map_fd(SOCKETS_MAP_NAME)
    }

    fn sweeper(&self) -> Result<CleanupIter> {
        let link = self
            .cleanup_link
            .and_then(|index| self.links.get(index))
            .ok_or_else(|| anyhow!("cleanup iterator is not attached"))?;
        let link = link
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate the cleanup iterator link")?;
        Ok(CleanupIter { link })
    }

    fn release(&mut self) {
        if self.object.is_none() {
            return;
        }
        debug!("Releasing {} socket enricher links", self.links.len());
        for link in self.links.drain(..) {
            drop(link);
        }
        self.cleanup_link = None;
        self.object = None;
    }
}

impl Drop for KernelProbes {
    fn drop(&mut self) {
        if !self.links.is_empty() {
            warn!("Dropping socket enricher probes that were not released explicitly");
        }
        self.release();
    }
}

/// Runs the cleanup iterator from the sweep thread.
///
/// Holds its own reference to the iterator link, so it must be dropped before the link is
/// expected to be detached.
pub struct CleanupIter {
    link: OwnedFd,
}

impl Sweeper for CleanupIter {
    fn sweep(&mut self) -> Result<()> {
        let fd = unsafe { libbpf_sys::bpf_iter_create(self.link.as_raw_fd()) };
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(-fd)).context("open BPF iterator");
        }

        // SAFETY: bpf_iter_create returned a new file descriptor that nothing else owns
        let mut file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        let mut sink = Vec::new();
        file.read_to_end(&mut sink).context("read BPF iterator")?;
        Ok(())
    }
}

use crate::error::AttachmentError;
use crate::kernel::{Collection, Kernel};
use crate::prelude::*;
use nettracer_bpf::{ObjectTemplate, PerfReader, ReaderHandle};
use socket_enricher::SOCKETS_MAP_NAME;
use std::collections::HashSet;
use std::os::fd::{AsFd, BorrowedFd};

/// Constant holding the network namespace an attachment's programs run for
pub const CURRENT_NETNS: &str = "current_netns";

/// What every attachment of a tracer loads and attaches
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub program: String,
    pub perf_map: String,
    pub socket_attach: i32,
    pub perf_buffer_pages: usize,
}

/// The in-kernel resources tracing one network namespace.
///
/// The resources are released in a fixed order: reader, raw socket, then the program set. The
/// slots are empty until acquired, so a partially built attachment releases only what it holds.
pub struct Attachment<C, S> {
    reader: Option<ReaderHandle>,
    socket: Option<S>,
    collection: Option<C>,

    // Pids relying on this attachment. Several containers of a pod, or host network pods, share
    // a network namespace: the programs are attached once for all of them.
    users: HashSet<u32>,
}

impl<C: Collection, S: AsFd> Attachment<C, S> {
    /// Load and attach the programs for the network namespace `netns` of `pid`.
    ///
    /// When `sockets` is set, the programs share that sockets map instead of creating their own
    /// and learn which namespace they run for through [`CURRENT_NETNS`].
    pub fn new<K>(
        kernel: &K,
        pid: u32,
        netns: u64,
        template: &ObjectTemplate,
        sockets: Option<BorrowedFd<'_>>,
        options: &AttachOptions,
    ) -> Result<(Self, PerfReader), AttachmentError>
    where
        K: Kernel<Collection = C, Socket = S>,
    {
        let mut attachment = Self {
            reader: None,
            socket: None,
            collection: None,
            users: HashSet::from([pid]),
        };

        let mut spec = template.copy();
        if let Some(sockets) = sockets {
            // Programs compare against the 32 low bits of the inode
            let netns = netns as u32;
            spec.rewrite_constant(CURRENT_NETNS, &netns.to_ne_bytes())
                .with_context(|| format!("rewriting constants while attaching to pid {pid}"))
                .map_err(AttachmentError::RewriteConstants)?;
            spec.replace_map(SOCKETS_MAP_NAME, sockets);
        }

        let collection = kernel.load(&spec).map_err(AttachmentError::Load)?;
        let collection = attachment.collection.insert(collection);

        let (handle, reader) = collection
            .open_reader(&options.perf_map, options.perf_buffer_pages)
            .map_err(|source| AttachmentError::PerfReader {
                map: options.perf_map.clone(),
                source,
            })?;
        attachment.reader = Some(handle);

        let program = collection
            .program_fd(&options.program)
            .map_err(|source| AttachmentError::ProgramFd {
                name: options.program.clone(),
                source,
            })?
            .ok_or_else(|| AttachmentError::ProgramNotFound(options.program.clone()))?;

        let socket = kernel
            .open_raw_socket(pid)
            .map_err(AttachmentError::RawSocket)?;
        let socket = attachment.socket.insert(socket);

        kernel
            .attach_socket_program(socket.as_fd(), options.socket_attach, program.as_fd())
            .map_err(AttachmentError::SocketAttach)?;

        debug!("Attached {} for pid {pid} in netns {netns}", options.program);
        Ok((attachment, reader))
    }
}

impl<C, S> Attachment<C, S> {
    pub fn users(&self) -> &HashSet<u32> {
        &self.users
    }

    pub fn has_user(&self, pid: u32) -> bool {
        self.users.contains(&pid)
    }

    pub fn add_user(&mut self, pid: u32) {
        self.users.insert(pid);
    }

    /// Returns true when `pid` was the last user
    pub fn remove_user(&mut self, pid: u32) -> bool {
        self.users.remove(&pid);
        self.users.is_empty()
    }

    /// Release the reader, the raw socket and the program set, in that order.
    ///
    /// Closing the reader ends the ingestion of this attachment. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        drop(self.socket.take());
        drop(self.collection.take());
    }
}

impl<C, S> Drop for Attachment<C, S> {
    fn drop(&mut self) {
        self.release();
    }
}

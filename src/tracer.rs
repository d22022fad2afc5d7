use crate::attachment::{AttachOptions, Attachment};
use crate::config::TracerConfig;
use crate::error::{AttachmentError, TracerError};
use crate::event::Status;
use crate::kernel::{Kernel, LibbpfKernel};
use crate::prelude::*;
use nettracer_bpf::{ObjectTemplate, PerfReader, ReadError};
use socket_enricher::{SOCKETS_MAP_NAME, SocketEnricher};
use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::os::fd::AsFd;
use std::sync::Arc;

/// A handler function receiving the events of every attachment.
///
/// Called from one ingestion thread per attachment, so it must be safe to call concurrently.
pub type EventHandler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Builds an event carrying a status message
pub type BaseEventBuilder<E> = Box<dyn Fn(Status) -> E + Send + Sync>;

/// Decodes one raw sample of the network namespace `netns`.
///
/// Returning `Ok(None)` filters the sample out.
pub type EventDecoder<E> = Box<dyn Fn(&[u8], u64) -> Result<Option<E>> + Send + Sync>;

struct Pipeline<E> {
    base_event: BaseEventBuilder<E>,
    decode: EventDecoder<E>,
}

/// Network tracer attaching a BPF program to one raw socket per network namespace.
///
/// Attaching several pids sharing a network namespace loads the program once. Events from
/// every namespace are decoded on a thread per attachment and passed to the attach callback.
///
/// The registry is mutated through `&mut self` only: callers attaching from several threads
/// have to wrap the tracer in a lock.
pub struct Tracer<E, K: Kernel = LibbpfKernel> {
    // key: network namespace inode number
    attachments: HashMap<u64, Attachment<K::Collection, K::Socket>>,
    // Must outlive every attachment sharing its sockets map
    enricher: Option<SocketEnricher<K::Probes>>,

    template: ObjectTemplate,
    options: AttachOptions,
    pipeline: Arc<Pipeline<E>>,
    event_handler: Option<EventHandler<E>>,
    kernel: K,
}

impl<E: Send + 'static> Tracer<E, LibbpfKernel> {
    pub fn new(
        template: ObjectTemplate,
        config: &TracerConfig,
        base_event: impl Fn(Status) -> E + Send + Sync + 'static,
        decode: impl Fn(&[u8], u64) -> Result<Option<E>> + Send + Sync + 'static,
    ) -> Result<Self, TracerError> {
        Self::with_kernel(LibbpfKernel, template, config, base_event, decode)
    }
}

impl<E: Send + 'static, K: Kernel> Tracer<E, K> {
    /// Create a tracer on top of `kernel`.
    ///
    /// A socket enricher is only started when the template has a sockets map. Failing to start
    /// it is logged and the tracer runs without it, unless the config requires enrichment.
    pub fn with_kernel(
        kernel: K,
        template: ObjectTemplate,
        config: &TracerConfig,
        base_event: impl Fn(Status) -> E + Send + Sync + 'static,
        decode: impl Fn(&[u8], u64) -> Result<Option<E>> + Send + Sync + 'static,
    ) -> Result<Self, TracerError> {
        let enricher = if template.has_map(SOCKETS_MAP_NAME) {
            match kernel.start_enricher(&config.enricher) {
                Ok(enricher) => Some(enricher),
                Err(err) if config.require_enrichment => return Err(TracerError::Enrichment(err)),
                Err(err) => {
                    // Non fatal: support kernels without BTF
                    error!("creating socket enricher: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            attachments: HashMap::new(),
            enricher,
            template,
            options: AttachOptions {
                program: config.program.clone(),
                perf_map: config.perf_map.clone(),
                socket_attach: config.socket_attach,
                perf_buffer_pages: config.perf_buffer_pages,
            },
            pipeline: Arc::new(Pipeline {
                base_event: Box::new(base_event),
                decode: Box::new(decode),
            }),
            event_handler: None,
            kernel,
        })
    }

    /// Start tracing the network namespace of `pid`, sending its events to `callback`.
    ///
    /// If the namespace is already traced, `pid` is only recorded as one more user and the
    /// events keep flowing to the callback of the first attach.
    pub fn attach(
        &mut self,
        pid: u32,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Result<(), TracerError> {
        self.attach_with_handler(pid, Arc::new(callback))
    }

    pub(crate) fn attach_with_handler(
        &mut self,
        pid: u32,
        callback: EventHandler<E>,
    ) -> Result<(), TracerError> {
        let netns = self
            .kernel
            .netns_of(pid)
            .map_err(|source| TracerError::NamespaceResolution { pid, source })?;

        if let Some(attachment) = self.attachments.get_mut(&netns) {
            attachment.add_user(pid);
            debug!("pid {pid} shares the traced netns {netns}");
            return Ok(());
        }

        let sockets = match &self.enricher {
            Some(enricher) => enricher
                .sockets_map()
                .map_err(|err| TracerError::AttachmentCreation {
                    pid,
                    source: AttachmentError::Load(err),
                })?,
            None => None,
        };
        let (attachment, reader) = Attachment::new(
            &self.kernel,
            pid,
            netns,
            &self.template,
            sockets.as_ref().map(AsFd::as_fd),
            &self.options,
        )
        .map_err(|source| TracerError::AttachmentCreation { pid, source })?;

        let pipeline = self.pipeline.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("netns-{netns}"))
            .spawn(move || listen(netns, reader, &pipeline, callback));
        if let Err(err) = spawned {
            // Dropping the attachment releases it
            return Err(TracerError::AttachmentCreation {
                pid,
                source: AttachmentError::Ingestion(err),
            });
        }

        self.attachments.insert(netns, attachment);
        Ok(())
    }

    /// Register the handler used by [`Tracer::attach_container`]
    pub fn set_event_handler(&mut self, handler: impl Fn(E) + Send + Sync + 'static) {
        self.event_handler = Some(Arc::new(handler));
    }

    /// Register a handler whose type is only known at runtime.
    ///
    /// # Panics
    ///
    /// Panics if `handler` is not an [`EventHandler<E>`]: a handler of another event type is a
    /// configuration error.
    pub fn set_event_handler_any(&mut self, handler: Box<dyn Any>) {
        match handler.downcast::<EventHandler<E>>() {
            Ok(handler) => self.event_handler = Some(*handler),
            Err(_) => panic!("event handler invalid"),
        }
    }

    pub(crate) fn event_handler(&self) -> Option<EventHandler<E>> {
        self.event_handler.clone()
    }
}

impl<E, K: Kernel> Tracer<E, K> {
    /// Stop tracing for `pid`. The last pid of a namespace releases its attachment.
    pub fn detach(&mut self, pid: u32) -> Result<(), TracerError> {
        let netns = self
            .attachments
            .iter()
            .find(|(_, attachment)| attachment.has_user(pid))
            .map(|(netns, _)| *netns)
            .ok_or(TracerError::NotAttached(pid))?;

        let last_user = self
            .attachments
            .get_mut(&netns)
            .is_some_and(|attachment| attachment.remove_user(pid));
        if last_user {
            self.release_attachment(netns);
        }
        Ok(())
    }

    /// Release every attachment, whatever its users, then the socket enricher
    pub fn close(&mut self) {
        let namespaces: Vec<u64> = self.attachments.keys().copied().collect();
        for netns in namespaces {
            self.release_attachment(netns);
        }

        if let Some(enricher) = self.enricher.take() {
            enricher.close();
        }
    }

    fn release_attachment(&mut self, netns: u64) {
        if let Some(mut attachment) = self.attachments.remove(&netns) {
            attachment.release();
            debug!("Released attachment of netns {netns}");
        }
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Pids relying on the attachment of `netns`
    pub fn users(&self, netns: u64) -> Option<&HashSet<u32>> {
        self.attachments.get(&netns).map(|attachment| attachment.users())
    }

    pub fn is_attached(&self, pid: u32) -> bool {
        self.attachments.values().any(|attachment| attachment.has_user(pid))
    }

    pub fn has_enricher(&self) -> bool {
        self.enricher.is_some()
    }
}

impl<E, K: Kernel> Drop for Tracer<E, K> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward the records of one attachment to `callback` until its reader is closed
fn listen<E>(
    netns: u64,
    mut reader: PerfReader,
    pipeline: &Pipeline<E>,
    callback: EventHandler<E>,
) {
    loop {
        let record = match reader.read() {
            Ok(record) => record,
            Err(ReadError::Closed) => break,
            Err(ReadError::Io(err)) => {
                let msg = format!("Error reading perf ring buffer ({netns}): {err}");
                callback((pipeline.base_event)(Status::error(msg)));
                break;
            }
        };

        if record.lost_samples != 0 {
            let msg = format!("lost {} samples ({netns})", record.lost_samples);
            callback((pipeline.base_event)(Status::warn(msg)));
            continue;
        }

        match (pipeline.decode)(&record.raw_sample, netns) {
            Ok(Some(event)) => callback(event),
            Ok(None) => {}
            Err(err) => callback((pipeline.base_event)(Status::error(format!("{err:#}")))),
        }
    }
    debug!("Stopped reading events of netns {netns}");
}

use thiserror::Error;

/// A failed step while building an attachment. Everything acquired before that step has been
/// released when this error is returned.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Failed to rewrite constants")]
    RewriteConstants(#[source] anyhow::Error),

    #[error("Failed to create BPF collection")]
    Load(#[source] anyhow::Error),

    #[error("Failed to open a perf reader on map {map:?}")]
    PerfReader {
        map: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to get the fd of BPF program {name:?}")]
    ProgramFd {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("BPF program {0:?} not found")]
    ProgramNotFound(String),

    #[error("Failed to open raw socket")]
    RawSocket(#[source] anyhow::Error),

    #[error("Failed to attach BPF program to the raw socket")]
    SocketAttach(#[source] anyhow::Error),

    #[error("Failed to spawn the ingestion thread")]
    Ingestion(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("Failed to get the network namespace of pid {pid}")]
    NamespaceResolution {
        pid: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to create network tracer attachment for pid {pid}")]
    AttachmentCreation {
        pid: u32,
        #[source]
        source: AttachmentError,
    },

    #[error("pid {0} is not attached")]
    NotAttached(u32),

    #[error("No event handler registered")]
    NoEventHandler,

    #[error("Failed to create socket enricher")]
    Enrichment(#[source] anyhow::Error),
}

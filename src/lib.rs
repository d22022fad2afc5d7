//! Per network namespace packet tracing with BPF
//!
//! A [`Tracer`] attaches a BPF socket program to a raw socket in the network namespace of each
//! attached pid, once per namespace, and streams the decoded records to an event handler. When
//! the program shares the `sockets` map, a [`SocketEnricher`](socket_enricher::SocketEnricher)
//! keeps that map filled with the owner of every socket.

pub mod attachment;
pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod kernel;
pub mod netns;
pub mod prelude;
pub mod rawsock;
pub mod tracer;

pub use attachment::{AttachOptions, Attachment, CURRENT_NETNS};
pub use config::TracerConfig;
pub use container::{Container, ContainerInfo};
pub use error::{AttachmentError, TracerError};
pub use event::{Severity, Status};
pub use kernel::{Collection, Kernel, LibbpfKernel};
pub use tracer::{BaseEventBuilder, EventDecoder, EventHandler, Tracer};

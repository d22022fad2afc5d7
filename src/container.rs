use crate::error::TracerError;
use crate::kernel::Kernel;
use crate::tracer::Tracer;
use serde::{Deserialize, Serialize};

/// A container as discovered by the container collection
pub trait Container {
    fn id(&self) -> &str;

    /// Pid of the container's init process
    fn pid(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub pid: u32,
}

impl Container for ContainerInfo {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl<E: Send + 'static, K: Kernel> Tracer<E, K> {
    /// Attach the container's pid, sending its events to the registered event handler
    pub fn attach_container(&mut self, container: &impl Container) -> Result<(), TracerError> {
        let handler = self.event_handler().ok_or(TracerError::NoEventHandler)?;
        log::debug!("Attaching container {} (pid {})", container.id(), container.pid());
        self.attach_with_handler(container.pid(), handler)
    }

    pub fn detach_container(&mut self, container: &impl Container) -> Result<(), TracerError> {
        self.detach(container.pid())
    }
}

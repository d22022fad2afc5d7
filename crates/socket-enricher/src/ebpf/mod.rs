mod kernel_probes;

pub use kernel_probes::{CleanupIter, KernelProbes};

use anyhow::Result;

/// A loaded object whose programs can be attached to kernel hooks.
///
/// Implementors keep every link they create and release them in attach order. The
/// [`attach_kprobe!`](crate::attach_kprobe) and
/// [`attach_kprobe_kretprobe!`](crate::attach_kprobe_kretprobe) macros build named attach
/// steps on top of this trait.
pub trait ProbeSet {
    /// Attach `program` on entry (or return, with `retprobe`) of kernel function `function`
    fn attach_kprobe(&mut self, program: &str, function: &str, retprobe: bool) -> Result<()>;

    /// Attach the iterator `program`, read it to completion once and detach it again
    fn run_iterator(&mut self, program: &str) -> Result<()>;

    /// Attach the map iterator `program` over map `map` and keep it for later runs
    fn attach_map_iterator(&mut self, program: &str, map: &str) -> Result<()>;
}

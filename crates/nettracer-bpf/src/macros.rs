//! Macros for attaching kprobes and kretprobes
//!
//! The generated methods call [`ProbeSet::attach_kprobe`](crate::ProbeSet::attach_kprobe), so
//! they must be expanded inside an `impl` of, or a trait extending, [`ProbeSet`](crate::ProbeSet).

/// Generate methods to attach kprobe/kretprobe pairs on one kernel function
#[macro_export]
macro_rules! attach_kprobe_kretprobe {
    ($name:ident, $prog_entry:ident, $prog_return:ident, $func:ident) => {
        fn $name(&mut self) -> anyhow::Result<()> {
            use anyhow::Context;

            self.attach_kprobe(stringify!($prog_entry), stringify!($func), false)
                .context(format!("Failed to attach {} kprobe", stringify!($func)))?;
            self.attach_kprobe(stringify!($prog_return), stringify!($func), true)
                .context(format!("Failed to attach {} kretprobe", stringify!($func)))?;
            Ok(())
        }
    };
    ($func:ident, $prog_entry:ident, $prog_return:ident) => {
        $crate::paste::paste! {
            $crate::attach_kprobe_kretprobe!([<attach_ $func>], $prog_entry, $prog_return, $func);
        }
    };
}

/// Generate methods to attach single kprobes (entry only)
#[macro_export]
macro_rules! attach_kprobe {
    ($name:ident, $prog:ident, $func:ident) => {
        fn $name(&mut self) -> anyhow::Result<()> {
            use anyhow::Context;

            self.attach_kprobe(stringify!($prog), stringify!($func), false)
                .context(format!("Failed to attach {} kprobe", stringify!($func)))?;
            Ok(())
        }
    };
    ($func:ident, $prog:ident) => {
        $crate::paste::paste! {
            $crate::attach_kprobe!([<attach_ $func>], $prog, $func);
        }
    };
}

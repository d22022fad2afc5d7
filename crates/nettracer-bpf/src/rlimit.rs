use anyhow::Result;

/// Bump memlock rlimit to allow BPF map and perf buffer allocation
///
/// Kernels without memcg-based BPF accounting charge maps against RLIMIT_MEMLOCK, so the
/// limit is raised to infinity before anything gets loaded.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) };
    if ret != 0 {
        anyhow::bail!(
            "Failed to increase memlock rlimit: {}",
            std::io::Error::last_os_error()
        );
    }

    Ok(())
}

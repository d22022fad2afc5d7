//! Raw packet sockets opened inside the network namespace of another process

use crate::netns::net_namespace;
use crate::prelude::*;
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Open an `AF_PACKET` raw socket capturing every protocol in the network namespace of `pid`.
///
/// The namespace switch happens on a short-lived thread, the calling thread never leaves its
/// own namespace. The socket keeps capturing in the target namespace after that thread exits.
pub fn open_raw_socket(pid: u32) -> Result<OwnedFd> {
    let namespace = net_namespace(pid)
        .with_context(|| format!("Failed to resolve the network namespace of pid {pid}"))?;
    let netns = File::open(&namespace.path)
        .with_context(|| format!("Failed to open the network namespace of pid {pid}"))?;

    let opener = std::thread::Builder::new()
        .name("rawsock".into())
        .spawn(move || -> Result<OwnedFd> {
            setns(&netns, CloneFlags::CLONE_NEWNET)
                .with_context(|| format!("Failed to enter the network namespace of pid {pid}"))?;
            open_packet_socket()
        })
        .context("Failed to spawn the raw socket thread")?;

    opener
        .join()
        .map_err(|_| anyhow!("Raw socket thread panicked"))?
}

fn open_packet_socket() -> Result<OwnedFd> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("Failed to create AF_PACKET socket");
    }

    // SAFETY: socket(2) returned a new descriptor owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Attach `program` to `socket` with `setsockopt(SOL_SOCKET, option, program_fd)`
pub fn attach_program(socket: BorrowedFd<'_>, option: i32, program: BorrowedFd<'_>) -> Result<()> {
    let program_fd: libc::c_int = program.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            &program_fd as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("setsockopt(SOL_SOCKET, {option}) failed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixDatagram;

    #[test_log::test]
    fn test_attach_rejects_non_program_fd() {
        let (socket, other) = UnixDatagram::pair().unwrap();

        let err = attach_program(socket.as_fd(), libc::SO_ATTACH_BPF, other.as_fd()).unwrap_err();
        assert!(err.to_string().contains("setsockopt"));
    }

    #[test_log::test]
    fn test_unknown_pid_fails_before_switching() {
        let err = open_raw_socket(u32::MAX).unwrap_err();
        assert!(err.to_string().contains("network namespace"));
    }
}

use anyhow::{Context, Result};
use log::{debug, warn};
use std::os::fd::OwnedFd;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::EnricherConfig;
use crate::ebpf::KernelProbes;
use crate::probes::attach_socket_probes;

/// One pass of the periodic cleanup, run on the sweep thread
pub trait Sweeper: Send + 'static {
    fn sweep(&mut self) -> Result<()>;
}

/// Loaded and attached socket enricher programs
pub trait EnricherProbes {
    type Sweeper: Sweeper;

    /// A new file descriptor referring to the sockets map
    fn sockets_map(&self) -> Result<OwnedFd>;

    /// Build the sweeper evicting entries of destroyed sockets
    fn sweeper(&self) -> Result<Self::Sweeper>;

    /// Release every probe link in attach order, then the programs and maps
    fn release(&mut self);
}

struct Running<P> {
    sockets: OwnedFd,
    done: Sender<()>,
    sweep_thread: JoinHandle<()>,
    probes: P,
}

/// SocketEnricher exposes a map of the processes owning each socket.
///
/// Network programs reuse that map to report the owning process of the traffic they see. Programs
/// referring to the map must be released before the enricher is closed.
pub struct SocketEnricher<P: EnricherProbes = KernelProbes> {
    running: Mutex<Option<Running<P>>>,
}

impl SocketEnricher<KernelProbes> {
    /// Load the socket enricher programs, attach them and start sweeping
    pub fn new(config: &EnricherConfig) -> Result<Self> {
        let sweep_interval = config.sweep_interval()?;

        let mut probes = KernelProbes::load(config)?;
        if let Err(err) = attach_socket_probes(&mut probes) {
            probes.release();
            return Err(err);
        }

        Self::start(probes, sweep_interval)
    }
}

impl<P: EnricherProbes> SocketEnricher<P> {
    /// Start sweeping with already attached probes.
    ///
    /// The probes are released if the sweep cannot be started.
    pub fn start(mut probes: P, sweep_interval: Duration) -> Result<Self> {
        let prepared = probes
            .sockets_map()
            .and_then(|sockets| Ok((sockets, probes.sweeper()?)));
        let (sockets, sweeper) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                probes.release();
                return Err(err);
            }
        };

        let (done, done_rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("socket-enricher".into())
            .spawn(move || cleanup_deleted_sockets(sweeper, done_rx, sweep_interval));
        let sweep_thread = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                probes.release();
                return Err(err).context("Failed to spawn the socket sweep thread");
            }
        };

        debug!("Socket enricher started, sweeping every {sweep_interval:?}");
        Ok(Self {
            running: Mutex::new(Some(Running {
                sockets,
                done,
                sweep_thread,
                probes,
            })),
        })
    }

    /// A new descriptor of the sockets map, to be shared with other programs at load time.
    ///
    /// Returns `None` once the enricher is closed.
    pub fn sockets_map(&self) -> Result<Option<OwnedFd>> {
        self.lock_running()
            .as_ref()
            .map(|running| running.sockets.try_clone())
            .transpose()
            .context("Failed to duplicate the sockets map fd")
    }

    pub fn is_closed(&self) -> bool {
        self.lock_running().is_none()
    }

    /// Stop the sweep and release every probe along with the sockets map.
    ///
    /// Safe to call several times and from several threads: the sweep is stopped once and the
    /// probes are released once. Concurrent callers return after the release completed.
    pub fn close(&self) {
        let mut running = self.lock_running();
        let Some(Running {
            sockets,
            done,
            sweep_thread,
            mut probes,
        }) = running.take()
        else {
            return;
        };

        drop(done);
        if sweep_thread.join().is_err() {
            warn!("Socket enricher sweep thread panicked");
        }
        drop(sockets);
        probes.release();
        debug!("Socket enricher closed");
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running<P>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: EnricherProbes> Drop for SocketEnricher<P> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sweep on every tick until `done` fires or its sender goes away
fn cleanup_deleted_sockets<S: Sweeper>(mut sweeper: S, done: Receiver<()>, interval: Duration) {
    loop {
        match done.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(err) = sweeper.sweep() {
                    warn!("socket enricher: {err:#}");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

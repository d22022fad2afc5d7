use anyhow::Result;
use libbpf_rs::{MapCore, PerfBufferBuilder};
use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

/// How long the poll thread waits for data before re-checking its shutdown flag
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of records buffered between the poll thread and the reader.
///
/// Once full, the poll thread stops draining the kernel buffers and the kernel reports
/// the overflow as lost samples.
pub const QUEUE_CAPACITY: usize = 1024;

/// Back-off of a sender waiting for room in a full queue
const SEND_RETRY: Duration = Duration::from_millis(1);

/// One record read from a perf buffer.
///
/// A record either carries a raw sample or reports samples the kernel had to drop because the
/// buffer was full, in which case `raw_sample` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub raw_sample: Vec<u8>,
    pub lost_samples: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The reader was closed, no more records will arrive
    #[error("perf reader has been closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Blocking read half of a perf reader.
///
/// Reads return records in the order the poll thread received them. As soon as the matching
/// [`ReaderHandle`] is closed, reads fail with [`ReadError::Closed`] and records still queued
/// are dropped.
pub struct PerfReader {
    rx: Receiver<io::Result<Record>>,
    closed: Arc<AtomicBool>,
}

impl PerfReader {
    pub fn read(&mut self) -> Result<Record, ReadError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReadError::Closed);
            }
            match self.rx.recv_timeout(POLL_TIMEOUT) {
                Ok(_) if self.closed.load(Ordering::Acquire) => return Err(ReadError::Closed),
                Ok(Ok(record)) => return Ok(record),
                Ok(Err(err)) => return Err(ReadError::Io(err)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ReadError::Closed),
            }
        }
    }

    /// Create the handle closing this reader. `close` runs once, right after the reader
    /// has been marked closed.
    pub fn handle(&self, close: impl FnOnce() + Send + 'static) -> ReaderHandle {
        ReaderHandle {
            closed: self.closed.clone(),
            close: Some(Box::new(close)),
        }
    }
}

/// Producer side feeding a [`PerfReader`].
///
/// Sends block while the queue is full, and give up once the reader is closed or gone.
#[derive(Clone)]
pub struct RecordSender {
    tx: SyncSender<io::Result<Record>>,
    closed: Arc<AtomicBool>,
}

impl RecordSender {
    /// Returns false once the reader is closed or gone
    pub fn send_sample(&self, data: &[u8]) -> bool {
        self.send(Ok(Record {
            raw_sample: data.to_vec(),
            lost_samples: 0,
        }))
    }

    pub fn send_lost(&self, count: u64) -> bool {
        self.send(Ok(Record {
            raw_sample: Vec::new(),
            lost_samples: count,
        }))
    }

    pub fn send_error(&self, err: io::Error) -> bool {
        self.send(Err(err))
    }

    fn send(&self, mut item: io::Result<Record>) -> bool {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    std::thread::sleep(SEND_RETRY);
                }
            }
        }
    }
}

/// Create a connected sender/reader pair buffering at most `capacity` records
pub fn channel(capacity: usize) -> (RecordSender, PerfReader) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let closed = Arc::new(AtomicBool::new(false));
    (
        RecordSender {
            tx,
            closed: closed.clone(),
        },
        PerfReader { rx, closed },
    )
}

/// Close half of a perf reader, see [`PerfReader::handle`].
///
/// Closing is idempotent and runs at most once, also when the handle is dropped without an
/// explicit close. It is safe to close while another thread is blocked in
/// [`PerfReader::read`]: that read wakes up with [`ReadError::Closed`].
pub struct ReaderHandle {
    closed: Arc<AtomicBool>,
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl ReaderHandle {
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            self.closed.store(true, Ordering::Release);
            close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_none()
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a perf reader over a `BPF_MAP_TYPE_PERF_EVENT_ARRAY` map.
///
/// A background thread polls the per-CPU buffers and forwards samples and lost-sample
/// notifications to the returned [`PerfReader`]. Closing the [`ReaderHandle`] stops and joins
/// that thread.
///
/// # Arguments
/// * `map` - The perf event array to read from
/// * `pages` - Number of pages per CPU buffer, must be a power of two
pub fn open_perf_reader<M: MapCore>(map: &M, pages: usize) -> Result<(ReaderHandle, PerfReader)> {
    let (sender, reader) = channel(QUEUE_CAPACITY);

    let sample_tx = sender.clone();
    let lost_tx = sender.clone();
    let perf = PerfBufferBuilder::new(map)
        .pages(pages)
        .sample_cb(move |_cpu: i32, data: &[u8]| {
            sample_tx.send_sample(data);
        })
        .lost_cb(move |_cpu: i32, count: u64| {
            lost_tx.send_lost(count);
        })
        .build()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    let poll_thread = std::thread::Builder::new()
        .name("perf-poller".into())
        .spawn(move || {
            while !shutdown_clone.load(Ordering::Relaxed) {
                if let Err(err) = perf.poll(POLL_TIMEOUT) {
                    if err.kind() == libbpf_rs::ErrorKind::Interrupted {
                        continue;
                    }
                    sender.send_error(io::Error::other(err));
                    break;
                }
            }
            debug!("Perf poll thread stopped");
        })?;

    let handle = reader.handle(move || {
        shutdown.store(true, Ordering::Relaxed);
        if poll_thread.join().is_err() {
            warn!("Perf poll thread panicked");
        }
    });

    Ok((handle, reader))
}

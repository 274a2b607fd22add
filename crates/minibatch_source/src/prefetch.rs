//! Background prefetching over a [`MinibatchSource`].
//!
//! A single worker thread pulls minibatches ahead of the consumer into a
//! bounded channel, so assembly (parsing, decoding, padding) overlaps
//! with training-side consumption. The channel depth bounds memory: the
//! worker blocks once `depth` batches are waiting.
//!
//! The worker stops on its own after delivering the epoch-end (empty)
//! minibatch or an error; [`PrefetchingSource::restart_epoch`] restarts
//! the underlying source and spawns a fresh worker. Dropping the
//! prefetcher signals shutdown and joins the worker.
//!
//! # Example
//! ```ignore
//! let mut prefetched = PrefetchingSource::new(source, 64, 4)?;
//! loop {
//!     let mb = prefetched.next_minibatch()?;
//!     if mb.is_empty() {
//!         break;
//!     }
//!     // train on mb
//! }
//! ```

use crate::error::Result;
use crate::minibatch::Minibatch;
use crate::source::MinibatchSource;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How often a blocked worker re-checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Wraps a [`MinibatchSource`] with a single background worker that keeps
/// up to `depth` assembled minibatches ready.
pub struct PrefetchingSource {
    source: Arc<MinibatchSource>,
    batch_size: usize,
    depth: usize,
    receiver: Receiver<Result<Minibatch>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchingSource {
    /// Starts prefetching `batch_size`-sample minibatches, keeping at
    /// most `depth` of them buffered.
    pub fn new(source: MinibatchSource, batch_size: usize, depth: usize) -> Result<Self> {
        let source = Arc::new(source);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (receiver, handle) =
            spawn_worker(source.clone(), batch_size, depth, shutdown.clone())?;
        Ok(Self {
            source,
            batch_size,
            depth,
            receiver,
            shutdown,
            handle: Some(handle),
        })
    }

    /// The next prefetched minibatch. An empty minibatch signals the end
    /// of the epoch, exactly as with the unwrapped source.
    pub fn next_minibatch(&self) -> Result<Minibatch> {
        match self.receiver.recv() {
            Ok(result) => result,
            // Worker already delivered the epoch end and exited; keep
            // answering with the epoch-end signal.
            Err(_) => Ok(Minibatch::empty(&self.source.schema_handle())),
        }
    }

    /// Restarts the underlying source's epoch and spawns a fresh worker.
    pub fn restart_epoch(&mut self) -> Result<()> {
        self.stop_worker();
        self.source.restart_epoch()?;
        self.shutdown = Arc::new(AtomicBool::new(false));
        let (receiver, handle) = spawn_worker(
            self.source.clone(),
            self.batch_size,
            self.depth,
            self.shutdown.clone(),
        )?;
        self.receiver = receiver;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Drain buffered batches so a worker blocked on a full channel
        // observes the flag promptly.
        for _ in self.receiver.try_iter() {}
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("prefetch worker panicked");
            }
        }
    }
}

impl Drop for PrefetchingSource {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn spawn_worker(
    source: Arc<MinibatchSource>,
    batch_size: usize,
    depth: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<(Receiver<Result<Minibatch>>, JoinHandle<()>)> {
    let (sender, receiver) = bounded(depth.max(1));
    let handle = std::thread::Builder::new()
        .name("minibatch-prefetch".into())
        .spawn(move || {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let result = source.next_minibatch(batch_size);
                let done = match &result {
                    Ok(mb) => mb.is_empty(),
                    Err(_) => true,
                };

                let mut item = result;
                loop {
                    match sender.send_timeout(item, SHUTDOWN_POLL) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(back)) => {
                            if shutdown.load(Ordering::Relaxed) {
                                return;
                            }
                            item = back;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => return,
                    }
                }
                if done {
                    debug!("prefetch worker reached end of epoch");
                    break;
                }
            }
        })?;
    Ok((receiver, handle))
}

//! Byte-level progress reporting for transfers
//!
//! The producer side ([`ProgressSink`]) never blocks while bytes are moving:
//! intermediate updates are dropped when the bounded queue is full, since a
//! later update supersedes them. [`ProgressSink::close`] delivers the final
//! snapshot (waiting at most [`FINAL_UPDATE_TIMEOUT`]) and closes the channel,
//! which ends the consumer's `recv` loop.

use crate::image::BlobStream;
use futures::TryStreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

pub const PROGRESS_QUEUE_CAPACITY: usize = 100;
pub const FINAL_UPDATE_TIMEOUT: Duration = Duration::from_millis(250);

/// Bytes transferred so far out of the known total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub complete: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.complete as f64 / self.total as f64 * 100.0
        }
    }

    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.complete >= self.total
    }
}

/// Create a bounded progress channel
pub fn progress_channel(capacity: usize) -> (ProgressSink, ProgressReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let sink = ProgressSink {
        inner: Arc::new(SinkInner {
            complete: AtomicU64::new(0),
            total: AtomicU64::new(0),
            sender: Mutex::new(Some(sender)),
        }),
    };
    (sink, ProgressReceiver { receiver })
}

/// Producer handle; clones share counters and the single underlying sender
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    complete: AtomicU64,
    total: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<TransferProgress>>>,
}

impl ProgressSink {
    /// Grow the expected total once sizes become known
    pub fn add_total(&self, bytes: u64) {
        self.inner.total.fetch_add(bytes, Ordering::SeqCst);
        self.publish();
    }

    /// Record transferred bytes
    pub fn advance(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.inner.complete.fetch_add(bytes, Ordering::SeqCst);
        self.publish();
    }

    /// Current state; `complete` never exceeds a non-zero `total`
    pub fn snapshot(&self) -> TransferProgress {
        let total = self.inner.total.load(Ordering::SeqCst);
        let complete = self.inner.complete.load(Ordering::SeqCst);
        TransferProgress {
            complete: if total > 0 { complete.min(total) } else { complete },
            total,
        }
    }

    /// Count bytes as they flow through a blob stream
    pub fn track(&self, stream: BlobStream) -> BlobStream {
        let sink = self.clone();
        Box::pin(stream.inspect_ok(move |chunk| sink.advance(chunk.len() as u64)))
    }

    pub fn is_closed(&self) -> bool {
        self.lock_sender().is_none()
    }

    /// Deliver the final snapshot and close the channel
    pub async fn close(&self) {
        let sender = self.lock_sender().take();
        let Some(sender) = sender else {
            return;
        };
        if sender
            .send_timeout(self.snapshot(), FINAL_UPDATE_TIMEOUT)
            .await
            .is_err()
        {
            debug!("final progress update was not delivered");
        }
    }

    fn publish(&self) {
        let sender = self.lock_sender().clone();
        let Some(sender) = sender else {
            return;
        };
        match sender.try_send(self.snapshot()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                debug!("progress receiver dropped");
            }
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<TransferProgress>>> {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Consumer side of a progress channel
pub struct ProgressReceiver {
    receiver: mpsc::Receiver<TransferProgress>,
}

impl ProgressReceiver {
    /// Next update, or `None` once the sink has been closed and drained
    pub async fn recv(&mut self) -> Option<TransferProgress> {
        self.receiver.recv().await
    }
}

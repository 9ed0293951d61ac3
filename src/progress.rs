//! Per-attachment download progress
//!
//! [`ProgressTracker`] keeps the latest completion fraction for each attachment
//! and broadcasts every update to subscribers (UI layers, tests). Entries are
//! never evicted; a stale fraction stays readable until the next attempt for
//! the same attachment overwrites it.

use crate::types::AttachmentId;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Smallest fraction reported once any byte has arrived, so a started
/// download is distinguishable from one that has not begun
pub const PROGRESS_THETA: f64 = 0.001;

/// Buffer size for the progress broadcast channel
const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// A single progress observation
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Attachment the fraction belongs to
    pub attachment_id: AttachmentId,
    /// Fraction completed, in `[0.001, 1.0]`
    pub fraction: f64,
}

/// Compute the reported fraction for a byte count
///
/// Returns `None` until at least one byte has arrived. An unknown or zero
/// total reports the minimum fraction.
pub fn fraction_completed(completed: u64, total: Option<u64>) -> Option<f64> {
    if completed == 0 {
        return None;
    }
    let raw = match total {
        Some(total) if total > 0 => (completed as f64 / total as f64).min(1.0),
        _ => 0.0,
    };
    Some(raw.max(PROGRESS_THETA))
}

/// Process-wide attachment progress map (cloneable - state is Arc-wrapped)
///
/// Writers for different attachments land on independent map shards, and a
/// read never blocks behind a writer for another attachment.
#[derive(Clone)]
pub struct ProgressTracker {
    states: Arc<DashMap<AttachmentId, f64>>,
    tx: broadcast::Sender<ProgressUpdate>,
}

impl ProgressTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            states: Arc::new(DashMap::new()),
            tx,
        }
    }

    /// Record a fraction and publish it
    pub fn set(&self, id: AttachmentId, fraction: f64) {
        let fraction = fraction.clamp(PROGRESS_THETA, 1.0);
        self.states.insert(id, fraction);
        // No subscribers is fine
        self.tx
            .send(ProgressUpdate {
                attachment_id: id,
                fraction,
            })
            .ok();
    }

    /// Latest fraction for an attachment, if any byte has ever arrived
    pub fn get(&self, id: AttachmentId) -> Option<f64> {
        self.states.get(&id).map(|entry| *entry.value())
    }

    /// Receive every subsequent update
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    /// Subsequent updates as a stream
    ///
    /// Updates missed by a lagging consumer are skipped rather than ending the stream.
    pub fn stream(&self) -> impl Stream<Item = ProgressUpdate> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(update) => Some(update),
                Err(e) => {
                    tracing::debug!(error = %e, "progress subscriber lagged");
                    None
                }
            }
        })
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

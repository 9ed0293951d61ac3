//! FIFO admission control for concurrent transfers.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueInner {
    in_flight: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

/// Admission controller capping concurrent transfers (cloneable - state is Arc-wrapped)
///
/// Callers are admitted strictly in arrival order. A slot freed by a finished
/// transfer goes to the oldest waiter, never to a newcomer, so no request can
/// be starved by later ones.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<Mutex<QueueInner>>,
    max_concurrent: usize,
}

/// Held while a transfer runs; dropping it frees the slot for the next waiter
pub struct AdmissionPermit {
    queue: DownloadQueue,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// Removes an abandoned waiter, or returns a slot it was granted but never claimed
struct PendingAdmission<'a> {
    queue: &'a DownloadQueue,
    ticket: u64,
    settled: bool,
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.queue.lock();
        if let Some(pos) = inner.waiters.iter().position(|w| w.ticket == self.ticket) {
            inner.waiters.remove(pos);
            tracing::debug!(ticket = self.ticket, "removed abandoned waiter");
        } else {
            drop(inner);
            tracing::debug!(ticket = self.ticket, "returning slot granted to abandoned waiter");
            self.queue.release();
        }
    }
}

impl DownloadQueue {
    /// Queue allowing `max_concurrent` transfers at once (at least one)
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            max_concurrent: max_concurrent.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // Invariants hold between statements, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a transfer slot
    ///
    /// Cancellation is observed before queueing, while waiting and once more
    /// right after admission, so a cancelled caller never holds a slot.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<AdmissionPermit> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (ticket, granted) = {
            let mut inner = self.lock();
            if inner.waiters.is_empty() && inner.in_flight < self.max_concurrent {
                inner.in_flight += 1;
                return Ok(AdmissionPermit {
                    queue: self.clone(),
                });
            }
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            let (grant, granted) = oneshot::channel();
            inner.waiters.push_back(Waiter { ticket, grant });
            tracing::debug!(ticket, waiting = inner.waiters.len(), "waiting for a transfer slot");
            (ticket, granted)
        };

        let mut pending = PendingAdmission {
            queue: self,
            ticket,
            settled: false,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(pending);
                Err(Error::Cancelled)
            }
            granted = granted => {
                pending.settled = true;
                granted.map_err(|_| Error::ShuttingDown)?;
                let permit = AdmissionPermit { queue: self.clone() };
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                Ok(permit)
            }
        }
    }

    /// Run `work` once admitted, holding the slot until it finishes
    pub async fn enqueue<F, Fut, T>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.admit(cancel).await?;
        work().await
    }

    fn release(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        // The slot passes straight to the oldest waiter. If its receiver is
        // gone, that waiter's PendingAdmission hands the slot back.
        if inner.in_flight < self.max_concurrent
            && let Some(waiter) = inner.waiters.pop_front()
        {
            inner.in_flight += 1;
            waiter.grant.send(()).ok();
        }
    }

    /// Transfers currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Callers waiting for a slot
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Configured slot count
    pub fn capacity(&self) -> usize {
        self.max_concurrent
    }
}

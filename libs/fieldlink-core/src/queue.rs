//! Per-link operation queue
//!
//! Ordered by (priority, submission sequence): highest priority first, FIFO
//! among equals. A retried operation keeps its original sequence number and
//! waits out its backoff in the queue instead of blocking the worker.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::CommError;
use crate::operation::{Job, Priority};

/// Queue entry
pub(crate) struct Queued {
    pub job: Box<dyn Job>,
    pub seq: u64,
    pub ready_at: Instant,
}

struct QueueState {
    entries: BTreeMap<(Priority, u64), Queued>,
    next_seq: u64,
    closed: bool,
}

/// Pending operations of one comm link
pub struct OpQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for OpQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl OpQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Add a new operation behind everything of equal or higher priority
    pub(crate) fn push(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(job);
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            debug!(queue = %self.name, "Enqueue {} @ {}", job.label(), job.priority());
            st.entries.insert(
                (job.priority(), seq),
                Queued {
                    job,
                    seq,
                    ready_at: Instant::now(),
                },
            );
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Put a started operation back, keeping its place among equals
    pub(crate) fn requeue(&self, queued: Queued) -> Result<(), Queued> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(queued);
            }
            st.entries
                .insert((queued.job.priority(), queued.seq), queued);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Check for a ready operation that outranks `priority`
    pub(crate) fn has_ready_above(&self, priority: Priority) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .iter()
            .take_while(|((p, _), _)| *p < priority)
            .any(|(_, q)| q.ready_at <= now)
    }

    /// Wait for the highest-priority ready operation; `None` once closed
    pub(crate) async fn next(&self) -> Option<Queued> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut st = self.state.lock();
                if st.closed {
                    return None;
                }
                let now = Instant::now();
                let ready = st
                    .entries
                    .iter()
                    .find(|(_, q)| q.ready_at <= now)
                    .map(|(key, _)| *key);
                if let Some(key) = ready {
                    return st.entries.remove(&key);
                }
                st.entries.values().map(|q| q.ready_at).min()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                },
                None => notified.await,
            }
        }
    }

    /// Close the queue and fail every waiting operation with `QueueDrained`
    ///
    /// Returns the number of drained operations. The operation currently
    /// running on the worker is not affected.
    pub fn close(&self) -> usize {
        let drained: Vec<Queued> = {
            let mut st = self.state.lock();
            st.closed = true;
            std::mem::take(&mut st.entries).into_values().collect()
        };
        self.notify.notify_waiters();
        let count = drained.len();
        for queued in drained {
            queued.job.finish(Err(CommError::QueueDrained));
        }
        if count > 0 {
            info!(queue = %self.name, "Drained {} queued operations", count);
        }
        count
    }
}

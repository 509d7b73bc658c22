//! Interval sampling job
//!
//! On every interval boundary the job opens a new completer epoch and queues
//! one sample operation per enabled controller. An epoch that has not drained
//! by the next boundary makes that boundary a skipped cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldlink_core::{Completer, Controller, EpochSummary};

use crate::lifecycle::LinkRegistry;
use crate::ops::{SampleSink, SampleStore};

/// What a boundary did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Previous epoch still had operations outstanding
    Skipped { pending: usize },
    /// Operations queued this cycle
    Started { submitted: usize },
}

/// Next multiple of `interval` strictly after `now`, aligned to the epoch
pub fn next_boundary(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.as_secs().max(1) as i64;
    let next = (now.timestamp().div_euclid(secs) + 1) * secs;
    DateTime::from_timestamp(next, 0).unwrap_or(now)
}

pub struct SampleJob {
    registry: Arc<LinkRegistry>,
    controllers: Vec<Arc<Controller>>,
    store: Arc<SampleStore>,
    completer: Arc<Completer>,
    last_summary: Arc<Mutex<Option<EpochSummary>>>,
    interval: Duration,
    listen_cycles: u32,
}

impl SampleJob {
    pub fn new(
        registry: Arc<LinkRegistry>,
        controllers: Vec<Arc<Controller>>,
        store: Arc<SampleStore>,
        interval: Duration,
    ) -> Self {
        let last_summary = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&last_summary);
        let completer = Completer::new("sample").with_callback(move |summary: EpochSummary| {
            info!(
                "Sample interval {} complete: {} ok, {} failed",
                summary.stamp.format("%H:%M:%S"),
                summary.entered - summary.failed,
                summary.failed
            );
            *slot.lock() = Some(summary);
        });
        Self {
            registry,
            controllers,
            store,
            completer: Arc::new(completer),
            last_summary,
            interval,
            listen_cycles: 0,
        }
    }

    /// Listen for sensor events between samples, `cycles` exchanges per interval
    pub fn with_listen_cycles(mut self, cycles: u32) -> Self {
        self.listen_cycles = cycles;
        self
    }

    pub fn completer(&self) -> &Arc<Completer> {
        &self.completer
    }

    /// Summary of the most recently drained epoch
    pub fn last_summary(&self) -> Option<EpochSummary> {
        self.last_summary.lock().clone()
    }

    /// Run one boundary
    pub fn run_cycle(&self, stamp: DateTime<Utc>) -> CycleOutcome {
        if !self.completer.is_drained() {
            let pending = self.completer.pending();
            warn!(
                "Skipping sample interval {}: {} polls of {} still outstanding",
                stamp,
                pending,
                self.completer.stamp()
            );
            return CycleOutcome::Skipped { pending };
        }

        self.completer.reset(stamp);
        let sink = SampleSink {
            store: Arc::clone(&self.store),
            stamp,
        };
        let mut submitted = 0;
        for ctl in &self.controllers {
            let ticket = self.completer.enter();
            match self.registry.submit_sample(ctl, ticket, sink.clone()) {
                Ok(()) => submitted += 1,
                Err(e) => warn!(controller = %ctl.name(), "Sample not queued: {}", e),
            }
        }
        self.completer.make_ready();
        debug!("Sample interval {}: {} polls queued", stamp, submitted);
        if self.listen_cycles > 0 {
            self.start_listening();
        }
        CycleOutcome::Started { submitted }
    }

    /// Queue idle event listens behind this interval's samples
    fn start_listening(&self) {
        let mut listening = 0;
        for ctl in &self.controllers {
            match self
                .registry
                .submit_listen(ctl, &self.store, self.listen_cycles)
            {
                Ok(true) => listening += 1,
                Ok(false) => {},
                Err(e) => debug!(controller = %ctl.name(), "Listen not queued: {}", e),
            }
        }
        if listening > 0 {
            debug!("{} sensors listening", listening);
        }
    }

    /// Run boundaries until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Sample job started, interval {:?}", self.interval);
            loop {
                let now = Utc::now();
                let stamp = next_boundary(now, self.interval);
                let wait = (stamp - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        self.run_cycle(stamp);
                    }
                    () = token.cancelled() => break,
                }
            }
            info!("Sample job stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_boundary() {
        let interval = Duration::from_secs(30);
        let at = |h, m, s| Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap();

        assert_eq!(next_boundary(at(8, 0, 1), interval), at(8, 0, 30));
        assert_eq!(next_boundary(at(8, 0, 29), interval), at(8, 0, 30));
        // Exactly on a boundary waits for the next one
        assert_eq!(next_boundary(at(8, 0, 30), interval), at(8, 1, 0));
        assert_eq!(next_boundary(at(8, 59, 45), interval), at(9, 0, 0));
    }

    #[test]
    fn test_zero_interval_is_one_second() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert_eq!(
            next_boundary(now, Duration::ZERO),
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 1).unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_cycle_drains_immediately() {
        let job = SampleJob::new(
            Arc::new(LinkRegistry::new()),
            Vec::new(),
            Arc::new(SampleStore::new()),
            Duration::from_secs(30),
        );
        let stamp = Utc::now();
        assert_eq!(job.run_cycle(stamp), CycleOutcome::Started { submitted: 0 });
        assert!(job.completer().is_drained());
        let summary = job.last_summary().unwrap();
        assert_eq!(summary.stamp, stamp);
        assert_eq!(summary.entered, 0);
    }

    #[tokio::test]
    async fn test_unknown_link_counts_as_failed() {
        let ctl = Arc::new(Controller::new("M-9", "missing", 9));
        let job = SampleJob::new(
            Arc::new(LinkRegistry::new()),
            vec![ctl],
            Arc::new(SampleStore::new()),
            Duration::from_secs(30),
        );
        assert_eq!(job.run_cycle(Utc::now()), CycleOutcome::Started { submitted: 0 });
        let summary = job.last_summary().unwrap();
        assert_eq!((summary.entered, summary.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_cancel_stops_job() {
        let job = SampleJob::new(
            Arc::new(LinkRegistry::new()),
            Vec::new(),
            Arc::new(SampleStore::new()),
            Duration::from_secs(3600),
        );
        let token = CancellationToken::new();
        let handle = job.spawn(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

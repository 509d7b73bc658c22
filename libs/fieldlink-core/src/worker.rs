//! Link worker - one task per comm link
//!
//! The worker owns the link messenger and drains the link queue strictly one
//! operation at a time. Links run in parallel with each other; a failure on
//! one link never reaches another.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{CommError, Result};
use crate::messenger::Messenger;
use crate::model::{CommLink, Controller};
use crate::operation::{Completion, OpHandler, Operation, Step};
use crate::property::{CommChannel, LinkSequence};
use crate::queue::{OpQueue, Queued};

/// Retry settings shared by every operation on a link
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Transport retries per operation
    pub max_retries: u32,
    /// Minimum wait before a retried operation runs again
    pub retry_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Queues work for a controller that asked for a settings download
///
/// Called by the link worker after an operation ends with
/// [`CommError::DownloadRequest`].
pub type DownloadHook = Arc<dyn Fn(&Arc<Controller>, &LinkSubmitter) + Send + Sync>;

/// Cloneable submit side of a link queue
#[derive(Clone)]
pub struct LinkSubmitter {
    link: Arc<CommLink>,
    queue: Arc<OpQueue>,
    max_retries: u32,
}

impl std::fmt::Debug for LinkSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSubmitter")
            .field("link", &self.link.name)
            .field("queue", &self.queue)
            .finish()
    }
}

impl LinkSubmitter {
    pub fn link(&self) -> &CommLink {
        &self.link
    }

    /// Operations waiting (not counting the one running)
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue an operation
    ///
    /// A second exclusive operation against a controller that already has one
    /// in flight is rejected here with a contention error and never queued.
    pub fn submit<H: OpHandler>(&self, mut op: Operation<H>) -> Result<Completion<H::Output>> {
        let completion = op.arm(&self.link, self.max_retries)?;
        // A closed queue hands the job back; dropping it reports QueueDrained
        self.queue
            .push(Box::new(op))
            .map_err(|_job| CommError::QueueDrained)?;
        Ok(completion)
    }
}

/// Handle to a running link worker
pub struct LinkHandle {
    submitter: LinkSubmitter,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LinkHandle").field(&self.submitter).finish()
    }
}

impl LinkHandle {
    /// Start the worker task for `link`
    pub fn spawn(link: CommLink, messenger: Box<dyn Messenger>, settings: EngineSettings) -> Self {
        Self::start(link, messenger, settings, None)
    }

    /// Start the worker task with a settings download hook
    pub fn spawn_with_download(
        link: CommLink,
        messenger: Box<dyn Messenger>,
        settings: EngineSettings,
        download: DownloadHook,
    ) -> Self {
        Self::start(link, messenger, settings, Some(download))
    }

    fn start(
        link: CommLink,
        messenger: Box<dyn Messenger>,
        settings: EngineSettings,
        download: Option<DownloadHook>,
    ) -> Self {
        let link = Arc::new(link);
        let submitter = LinkSubmitter {
            queue: Arc::new(OpQueue::new(link.name.clone())),
            link,
            max_retries: settings.max_retries,
        };
        let worker = LinkWorker {
            link: Arc::clone(&submitter.link),
            queue: Arc::clone(&submitter.queue),
            submitter: submitter.clone(),
            download,
            messenger,
            sequence: LinkSequence::new(),
            settings,
        };
        let task = tokio::spawn(worker.run());
        Self { submitter, task }
    }

    pub fn link(&self) -> &CommLink {
        self.submitter.link()
    }

    pub fn name(&self) -> &str {
        &self.submitter.link.name
    }

    /// Operations waiting (not counting the one running)
    pub fn queued(&self) -> usize {
        self.submitter.queued()
    }

    /// Queue an operation; see [`LinkSubmitter::submit`]
    pub fn submit<H: OpHandler>(&self, op: Operation<H>) -> Result<Completion<H::Output>> {
        self.submitter.submit(op)
    }

    /// Submit side that outlives a borrow of this handle
    pub fn submitter(&self) -> LinkSubmitter {
        self.submitter.clone()
    }

    /// Close the queue, let the running operation finish, stop the worker
    ///
    /// Returns the number of queued operations that were drained.
    pub async fn shutdown(self) -> usize {
        let drained = self.submitter.queue.close();
        if let Err(e) = self.task.await {
            error!(link = %self.submitter.link.name, "Worker task failed: {}", e);
        }
        drained
    }
}

struct LinkWorker {
    link: Arc<CommLink>,
    queue: Arc<OpQueue>,
    submitter: LinkSubmitter,
    download: Option<DownloadHook>,
    messenger: Box<dyn Messenger>,
    sequence: LinkSequence,
    settings: EngineSettings,
}

impl LinkWorker {
    async fn run(mut self) {
        info!(
            link = %self.link.name,
            protocol = %self.link.protocol,
            "Link worker started: {}",
            self.link.uri
        );
        while let Some(queued) = self.queue.next().await {
            self.execute(queued).await;
        }
        self.messenger.close().await;
        info!(link = %self.link.name, "Link worker stopped");
    }

    /// Drive one operation until it finishes or goes back to the queue
    async fn execute(&mut self, mut queued: Queued) {
        let controller = Arc::clone(queued.job.controller());
        loop {
            let result = {
                let mut chan = CommChannel::new(
                    &mut *self.messenger,
                    &self.link,
                    &controller,
                    &self.sequence,
                );
                queued.job.step(&mut chan).await
            };

            match result {
                Ok(Step::Continue) => continue,
                Ok(Step::Done) => {
                    queued.job.finish(Ok(()));
                    return;
                },
                Ok(Step::Again) => {
                    if self.queue.is_closed() {
                        queued.job.finish(Err(CommError::QueueDrained));
                        return;
                    }
                    if self.queue.has_ready_above(queued.job.priority()) {
                        debug!(link = %self.link.name, "{} yields", queued.job.label());
                        queued.ready_at = Instant::now();
                        self.put_back(queued);
                        return;
                    }
                },
                Err(e) => {
                    self.recover(&e).await;
                    if e.is_retryable() && queued.job.take_retry() {
                        let backoff = self
                            .messenger
                            .reopen_delay()
                            .map_or(self.settings.retry_backoff, |d| {
                                d.max(self.settings.retry_backoff)
                            });
                        warn!(
                            link = %self.link.name,
                            "{}: {} (retry {}/{} in {:?})",
                            queued.job.label(),
                            e,
                            queued.job.retries(),
                            queued.job.max_retries(),
                            backoff
                        );
                        queued.ready_at = Instant::now() + backoff;
                        self.put_back(queued);
                    } else {
                        let download = matches!(e, CommError::DownloadRequest(_));
                        queued.job.finish(Err(e));
                        if download {
                            self.request_download(&controller);
                        }
                    }
                    return;
                },
            }
        }
    }

    /// Resynchronize the link after a failed exchange
    async fn recover(&mut self, err: &CommError) {
        if err.needs_reopen() {
            self.messenger.close().await;
        } else if err.needs_drain() {
            self.messenger.drain().await;
        }
    }

    fn request_download(&self, controller: &Arc<Controller>) {
        match &self.download {
            Some(hook) => {
                info!(controller = %controller.name(), "Download requested, queueing settings");
                hook(controller, &self.submitter);
            },
            None => warn!(
                controller = %controller.name(),
                "Download requested but link {} has no settings download",
                self.link.name
            ),
        }
    }

    fn put_back(&self, queued: Queued) {
        if let Err(queued) = self.queue.requeue(queued) {
            queued.job.finish(Err(CommError::QueueDrained));
        }
    }
}

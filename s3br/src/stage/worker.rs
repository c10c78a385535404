use super::{Outcome, StageOperation, StageReport, StageSettings};
use crate::backoff::Backoff;
use crate::metrics::{Metric, Metrics};
use crate::queue::{Task, WorkQueue};
use crate::{ErrorKind, RemoteError};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Pops keys off a stage's queue and applies the stage operation to them until the queue is
/// drained.
///
/// Every worker has its own backoff state.  A failure makes the worker sleep before taking the
/// next key, which slows the whole stage down gradually when the object store starts throttling.
///
/// Each outcome is sent to the stage as soon as it happens, so nothing is lost if the worker is
/// aborted later.
pub(super) struct Worker<Op> {
    id: usize,
    op: Arc<Op>,
    queue: WorkQueue,
    downstream: Option<WorkQueue>,
    metrics: Metrics,
    backoff: Backoff,
    fetch_timeout: Duration,
    max_attempts: Option<usize>,
    tally: StageReport,
    tally_sender: mpsc::UnboundedSender<StageReport>,
}

impl<Op: StageOperation> Worker<Op> {
    pub(super) fn new(
        id: usize,
        op: Arc<Op>,
        queue: WorkQueue,
        downstream: Option<WorkQueue>,
        settings: &StageSettings,
        metrics: Metrics,
        tally_sender: mpsc::UnboundedSender<StageReport>,
    ) -> Self {
        Self {
            id,
            op,
            queue,
            downstream,
            metrics,
            backoff: Backoff::new(&settings.config),
            fetch_timeout: settings.timeout,
            max_attempts: settings.max_attempts,
            tally: StageReport::default(),
            tally_sender,
        }
    }

    fn record(&mut self, update: impl FnOnce(&mut StageReport)) {
        let mut increment = StageReport::default();
        update(&mut increment);
        self.tally += increment;

        // The receiver outlives every worker of the stage
        let _ = self.tally_sender.send(increment);
    }

    /// Process keys until the queue is drained or `cancel` is triggered
    #[instrument(skip_all, fields(stage = self.op.name(), worker = self.id))]
    pub(super) async fn run(mut self, cancel: CancellationToken) {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.queue.pop(self.fetch_timeout) => task,
            };

            let Some(task) = task else {
                if self.queue.is_drained() {
                    break;
                }

                // Nothing available right now, but some keys are still in flight and might come
                // back for another attempt
                continue;
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.op.execute(&task.key) => result,
            };

            let sleep = match result {
                Ok(outcome) => self.succeeded(task, outcome),
                Err(e) => self.failed(task, e).await,
            };

            if let Some(duration) = sleep {
                // Other workers may finish the queue while this one is backing off
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.queue.join() => break,
                    _ = tokio::time::sleep(duration) => {}
                }
            }
        }

        debug!(tally = ?self.tally, "Worker exiting");
    }

    /// Record the outcome of a successful execution.  Returns the time to sleep before the next
    /// key, if any.
    fn succeeded(&mut self, task: Task, outcome: Outcome) -> Option<Duration> {
        match outcome {
            Outcome::Processed => self.record(|tally| tally.processed += 1),
            Outcome::Skipped => self.record(|tally| tally.skipped += 1),
            Outcome::Forward => {
                self.record(|tally| tally.forwarded += 1);

                match &self.downstream {
                    Some(downstream) => downstream.push_key(task.key.clone()),
                    None => warn!(key = %task.key, "Stage has no downstream queue; key dropped"),
                }
            }
            Outcome::NotReady => {
                debug!(key = %task.key, "Not ready yet, putting back in queue");
                self.record(|tally| tally.deferred += 1);

                // Push before ack so the queue can't look drained in between
                self.queue.push(task);
                self.queue.ack();

                return Some(self.backoff.failed());
            }
        }

        self.queue.ack();
        self.backoff.succeeded();

        None
    }

    async fn failed(&mut self, task: Task, e: RemoteError) -> Option<Duration> {
        let failures = task.failures + 1;

        match e.kind() {
            ErrorKind::Throttled => {
                warn!(key = %task.key, failures, err = %e, "Request throttled");
                self.metrics.count(Metric::SlowDown).await;
            }
            ErrorKind::Transient => {
                warn!(key = %task.key, failures, err = %e, "Transient error");
                self.metrics.count(self.op.error_metric()).await;
            }
            ErrorKind::NotFound | ErrorKind::Unclassified => {
                error!(key = %task.key, failures, err = %e, "Error processing object");
                self.metrics.count(self.op.error_metric()).await;
            }
        }

        if let Some(max_attempts) = self.max_attempts {
            if failures >= max_attempts {
                error!(key = %task.key, failures, "Giving up on object after too many attempts");
                self.record(|tally| tally.abandoned += 1);
                self.queue.ack();

                return Some(self.backoff.failed());
            }
        }

        self.record(|tally| tally.failed += 1);
        self.queue.push(Task {
            key: task.key,
            failures,
        });
        self.queue.ack();

        Some(self.backoff.failed())
    }
}

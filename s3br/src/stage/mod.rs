//! The generic pipeline stage.
//!
//! Every stage of a backup or restore (compare, copy, tag, check-deleted-tag, restore) works the
//! same way: a [`WorkQueue`] of keys is drained by a pool of workers that each apply the stage's
//! [`StageOperation`] to one key at a time.  Only the operation differs, so there is one [`Stage`]
//! type generic over the operation.
//!
//! Concurrency has two levels.  A stage runs several coordinators ("worker groups", by default
//! one per CPU) and every coordinator runs its own pool of workers, all of them sharing the one
//! queue.  A coordinator never starts more workers than there are keys in the queue, and a stage
//! never starts more coordinators than that either.
use crate::metrics::{Metric, Metrics};
use crate::queue::WorkQueue;
use crate::{Config, RemoteError, Result};
use snafu::prelude::*;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

mod ops;
mod worker;

pub(crate) use ops::{CheckDeletedTagOperation, CompareOperation, CopyOperation};
pub(crate) use ops::{RestoreOperation, TagDeletedOperation};
use worker::Worker;

/// What happened to a key that a stage operation was applied to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The operation changed something on the remote side
    Processed,

    /// There was nothing to do for this key
    Skipped,

    /// The key must be handed to the next stage
    Forward,

    /// The key can't be processed yet; try again later.  Not counted as a failure.
    NotReady,
}

/// The operation a stage applies to each key
#[async_trait::async_trait]
pub(crate) trait StageOperation: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// The metric that queue depth is published as
    fn depth_metric(&self) -> Metric;

    /// The metric that failures other than throttling are counted in
    fn error_metric(&self) -> Metric;

    /// Workers per worker group, unless overridden in the config
    fn default_workers(&self) -> usize;

    /// Stages whose remote operations are slow poll their queue less often
    fn slow_polling(&self) -> bool {
        false
    }

    async fn execute(&self, key: &str) -> Result<Outcome, RemoteError>;
}

/// Counts of what a stage did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageReport {
    pub processed: usize,
    pub skipped: usize,
    pub forwarded: usize,

    /// Times a key wasn't ready and was put back in the queue
    pub deferred: usize,

    /// Failed attempts, each of which was retried
    pub failed: usize,

    /// Keys given up on after too many failed attempts
    pub abandoned: usize,
}

impl std::ops::AddAssign for StageReport {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.forwarded += other.forwarded;
        self.deferred += other.deferred;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
    }
}

/// Run `pipeline` with a fresh cancellation token, cancelling it and failing with
/// [`crate::S3BrError::Interrupted`] if `abort` completes first
pub(crate) async fn run_until_aborted<T, F, Fut>(
    abort: impl std::future::Future<Output = ()>,
    pipeline: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let cancel = CancellationToken::new();
    let pipeline = pipeline(cancel.clone());

    tokio::select! {
        result = pipeline => result,
        _ = abort => {
            warn!("Abort signal received; cancelling all in-flight work");
            cancel.cancel();
            crate::error::InterruptedSnafu.fail()
        }
    }
}

/// Never run more concurrent units than there are items to process
pub(crate) fn effective_count(configured: usize, queue_len: usize) -> usize {
    configured.min(queue_len)
}

/// Settings shared by every coordinator and worker of a stage
#[derive(Clone, Debug)]
pub(crate) struct StageSettings {
    pub workers: usize,
    pub groups: usize,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_attempts: Option<usize>,
    pub config: Arc<Config>,
}

impl StageSettings {
    fn new(config: &Config, op: &impl StageOperation) -> Self {
        Self {
            workers: config.thread_count.unwrap_or_else(|| op.default_workers()),
            groups: config.worker_groups(),
            poll_interval: if op.slow_polling() {
                config.slow_poll_interval()
            } else {
                config.poll_interval()
            },
            timeout: config.timeout(),
            max_attempts: config.max_attempts,
            config: Arc::new(config.clone()),
        }
    }
}

/// One stage of a pipeline, ready to run
pub(crate) struct Stage<Op> {
    op: Arc<Op>,
    queue: WorkQueue,
    downstream: Option<WorkQueue>,
    settings: StageSettings,
    metrics: Metrics,
}

impl<Op: StageOperation> Stage<Op> {
    pub(crate) fn new(op: Op, queue: WorkQueue, config: &Config, metrics: Metrics) -> Self {
        let settings = StageSettings::new(config, &op);

        Self {
            op: Arc::new(op),
            queue,
            downstream: None,
            settings,
            metrics,
        }
    }

    /// Keys the operation forwards are pushed into `queue`
    pub(crate) fn forward_to(mut self, queue: WorkQueue) -> Self {
        self.downstream = Some(queue);
        self
    }

    /// Drain the queue, returning once every key has been processed (or abandoned).
    ///
    /// Fails only with [`crate::S3BrError::Interrupted`] when `cancel` is triggered, or if one of
    /// the stage's tasks panics.
    #[instrument(skip_all, fields(stage = self.op.name()))]
    pub(crate) async fn run(self, cancel: &CancellationToken) -> Result<StageReport> {
        let depth = self.queue.len();
        self.metrics
            .publish_depth(self.op.depth_metric(), depth)
            .await;

        if depth == 0 {
            info!("Nothing to do");
            return Ok(StageReport::default());
        }

        let groups = effective_count(self.settings.groups, depth);
        info!(
            depth,
            groups,
            workers_per_group = self.settings.workers,
            "Starting stage"
        );

        let (tally_sender, mut tally_receiver) = mpsc::unbounded_channel();
        let mut coordinators = JoinSet::new();

        for group in 0..groups {
            let coordinator = Coordinator {
                group,
                op: self.op.clone(),
                queue: self.queue.clone(),
                downstream: self.downstream.clone(),
                settings: self.settings.clone(),
                metrics: self.metrics.clone(),
                tally_sender: tally_sender.clone(),
            };

            coordinators.spawn(coordinator.run(cancel.clone()));
        }

        drop(tally_sender);

        let mut first_error = None;
        while let Some(result) = coordinators.join_next().await {
            let result = result.context(crate::error::StageTaskFailedSnafu {
                stage: self.op.name(),
            });

            if let Err(e) = result.and_then(|result| result) {
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        // Every worker has been joined and every sender is gone, so this won't block
        let mut report = StageReport::default();
        while let Some(tally) = tally_receiver.recv().await {
            report += tally;
        }

        self.metrics
            .publish_depth(self.op.depth_metric(), self.queue.len())
            .await;

        info!(?report, "Stage complete");

        Ok(report)
    }
}

/// Runs one group of workers over the stage's queue and waits for the queue to drain
struct Coordinator<Op> {
    group: usize,
    op: Arc<Op>,
    queue: WorkQueue,
    downstream: Option<WorkQueue>,
    settings: StageSettings,
    metrics: Metrics,
    tally_sender: mpsc::UnboundedSender<StageReport>,
}

impl<Op: StageOperation> Coordinator<Op> {
    #[instrument(skip_all, fields(stage = self.op.name(), group = self.group))]
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let workers = effective_count(self.settings.workers, self.queue.len());
        if workers == 0 {
            debug!("Queue already empty, not starting any workers");
            return Ok(());
        }

        debug!(workers, "Starting workers");

        // Dropping the set on an early return aborts every worker
        let mut pool = JoinSet::new();
        for id in 0..workers {
            let worker = Worker::new(
                id,
                self.op.clone(),
                self.queue.clone(),
                self.downstream.clone(),
                &self.settings,
                self.metrics.clone(),
                self.tally_sender.clone(),
            );

            pool.spawn(worker.run(cancel.clone()));
        }

        while !self.queue.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return crate::error::InterruptedSnafu.fail(),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let depth = self.queue.len();
            debug!(depth, "Queue depth");
            self.metrics
                .publish_depth(self.op.depth_metric(), depth)
                .await;
        }

        tokio::select! {
            _ = cancel.cancelled() => return crate::error::InterruptedSnafu.fail(),
            _ = self.queue.join() => {}
        }

        debug!("Queue drained, waiting for workers to exit");

        let deadline = tokio::time::sleep(self.settings.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = pool.join_next() => match result {
                    None => break,
                    Some(result) => {
                        result.context(crate::error::StageTaskFailedSnafu {
                            stage: self.op.name(),
                        })?;
                    }
                },
                _ = &mut deadline => {
                    warn!(stragglers = pool.len(), "Workers did not exit in time; aborting them");
                    pool.abort_all();

                    // Aborted workers drop their tally senders once they're joined
                    while pool.join_next().await.is_some() {}
                    break;
                }
            }
        }

        Ok(())
    }
}

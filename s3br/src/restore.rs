//! Restore of a backup bucket into another bucket
use crate::objstore::{Bucket, ObjectStorageFactory};
use crate::queue::WorkQueue;
use crate::stage::{self, CheckDeletedTagOperation, RestoreOperation, Stage, StageReport};
use crate::{Config, ErrorKind, Metric, Metrics, RemoteError, Result};
use snafu::prelude::*;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Builds a [`RestoreJob`] that copies the objects in a backup bucket into a destination bucket.
///
/// The destination bucket doesn't have to exist yet when the job starts; it's common for it to be
/// created by another process around the same time.  The job waits for it to appear.
#[derive(Debug)]
pub struct RestoreJobBuilder {
    config: Config,
    source: Box<dyn Bucket>,
    destination: Box<dyn Bucket>,
    metrics: Option<Metrics>,
    all: bool,
    check_deleted_tag: bool,
}

impl RestoreJobBuilder {
    pub fn new(config: Config, source: Box<dyn Bucket>, destination: Box<dyn Bucket>) -> Self {
        Self {
            config,
            source,
            destination,
            metrics: None,
            all: false,
            check_deleted_tag: false,
        }
    }

    /// Validate that the source bucket is accessible and start building a job that restores it
    /// into `destination`, with CloudWatch metrics (unless disabled in the config).
    ///
    /// The destination isn't validated, because it may not exist yet.
    pub async fn from_factory(
        factory: &ObjectStorageFactory,
        config: Config,
        source: &str,
        destination: &str,
    ) -> Result<Self> {
        let source = factory.validated_bucket(source).await?;
        let destination = factory.bucket(destination);

        Ok(Self::new(config, source, destination).metrics(factory.metrics()))
    }

    /// Restore every object, ignoring the deleted tag
    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    /// Don't restore objects that the backup tagged as deleted from their original bucket
    pub fn check_deleted_tag(mut self, check_deleted_tag: bool) -> Self {
        self.check_deleted_tag = check_deleted_tag;
        self
    }

    /// Publish metrics with `metrics`.  If not set, metrics are only logged.
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// List the objects in the source bucket, but don't restore anything yet
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub async fn build(self) -> Result<RestoreJob> {
        let keys = self
            .source
            .list_keys(self.config.prefix.as_deref(), self.config.objects_count)
            .await
            .with_context(|_| crate::error::ListKeysSnafu {
                bucket: self.source.name().to_string(),
            })?;

        debug!(count = keys.len(), "Listed source bucket");

        let metrics = self.metrics.unwrap_or_else(|| {
            Metrics::new(
                &self.config.metrics_namespace,
                &self.config.metrics_dimension,
                crate::LogSink,
            )
        });

        Ok(RestoreJob {
            config: self.config,
            source: self.source,
            destination: self.destination,
            metrics,
            keys,
            check_deleted_tag: self.check_deleted_tag && !self.all,
        })
    }
}

/// What a restore did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Number of keys listed in the source
    pub source_objects: usize,

    /// `None` if deleted objects weren't filtered out
    pub check_deleted_tag: Option<StageReport>,

    pub restore: StageReport,
}

impl RestoreSummary {
    pub fn restored(&self) -> usize {
        self.restore.processed
    }

    /// Number of objects not restored because they're tagged as deleted
    pub fn skipped_deleted(&self) -> usize {
        self.check_deleted_tag.map_or(0, |report| report.skipped)
    }

    /// Number of objects given up on after too many failed attempts, in any stage
    pub fn abandoned(&self) -> usize {
        self.check_deleted_tag.map_or(0, |report| report.abandoned) + self.restore.abandoned
    }
}

/// A restore ready to run, created by [`RestoreJobBuilder::build`]
#[derive(Debug)]
pub struct RestoreJob {
    config: Config,
    source: Box<dyn Bucket>,
    destination: Box<dyn Bucket>,
    metrics: Metrics,
    keys: Vec<String>,
    check_deleted_tag: bool,
}

impl RestoreJob {
    pub fn total_objects(&self) -> usize {
        self.keys.len()
    }

    /// Run the restore.
    ///
    /// If the `abort` future completes, in-flight requests are abandoned and this method returns
    /// [`crate::S3BrError::Interrupted`].
    pub async fn run(self, abort: impl Future<Output = ()>) -> Result<RestoreSummary> {
        stage::run_until_aborted(abort, |cancel| self.run_pipeline(cancel)).await
    }

    #[instrument(skip_all, fields(source = self.source.name(), destination = self.destination.name()))]
    async fn run_pipeline(self, cancel: CancellationToken) -> Result<RestoreSummary> {
        wait_for_bucket(self.destination.as_ref(), &self.config, &cancel).await?;

        let source_objects = self.keys.len();
        let restore_queue = WorkQueue::new();

        let check_deleted_tag = if self.check_deleted_tag {
            let check_queue = WorkQueue::new();
            for key in self.keys {
                check_queue.push_key(key);
            }

            self.metrics
                .publish_depth(Metric::ObjectsToCheckForDeletedTag, check_queue.len())
                .await;

            let report = Stage::new(
                CheckDeletedTagOperation::new(self.source.clone()),
                check_queue,
                &self.config,
                self.metrics.clone(),
            )
            .forward_to(restore_queue.clone())
            .run(&cancel)
            .await?;

            info!(
                skipped = report.skipped,
                "Filtered out objects tagged as deleted"
            );

            Some(report)
        } else {
            for key in self.keys {
                restore_queue.push_key(key);
            }

            None
        };

        info!(to_restore = restore_queue.len(), "Starting restore");

        let restore = Stage::new(
            RestoreOperation::new(self.source.clone(), self.destination.clone()),
            restore_queue,
            &self.config,
            self.metrics.clone(),
        )
        .run(&cancel)
        .await?;

        let summary = RestoreSummary {
            source_objects,
            check_deleted_tag,
            restore,
        };

        info!(restored = summary.restored(), "Restore complete");

        Ok(summary)
    }
}

/// Wait until `bucket` exists.
///
/// Each cycle polls the bucket up to `bucket_wait_attempts` times, `bucket_wait_delay` apart.
/// After `bucket_wait_cycles` cycles without the bucket appearing this fails with
/// [`crate::S3BrError::DestinationBucketMissing`].
pub(crate) async fn wait_for_bucket(
    bucket: &dyn Bucket,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<()> {
    let cycles = config.bucket_wait_cycles.max(1);
    let policy = again::RetryPolicy::fixed(config.bucket_wait_delay())
        .with_max_retries(config.bucket_wait_attempts.saturating_sub(1));

    for cycle in 1..=cycles {
        let attempt = policy.retry(|| async {
            match bucket.exists().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(RemoteError::new(
                    ErrorKind::NotFound,
                    "HeadBucket",
                    bucket.name(),
                    "bucket does not exist yet",
                )),
                Err(e) => Err(e),
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => return crate::error::InterruptedSnafu.fail(),
            result = attempt => result,
        };

        match result {
            Ok(()) => {
                debug!(bucket = bucket.name(), cycle, "Bucket exists");
                return Ok(());
            }
            Err(e) => {
                warn!(bucket = bucket.name(), cycle, cycles, err = %e, "Still waiting for bucket");
            }
        }
    }

    crate::error::DestinationBucketMissingSnafu {
        bucket: bucket.name().to_string(),
        cycles,
    }
    .fail()
}

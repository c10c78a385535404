//! Incremental backup of one bucket into another
use crate::keys::BackupPlan;
use crate::objstore::{Bucket, ObjectStorageFactory};
use crate::queue::WorkQueue;
use crate::stage::{self, CompareOperation, CopyOperation, Stage, StageReport, TagDeletedOperation};
use crate::{Config, Metric, Metrics, Result};
use snafu::prelude::*;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Builds a [`BackupJob`] from a source and destination bucket.
///
/// By default the backup is incremental: objects missing from the destination are copied, and
/// objects in both buckets are compared and copied only if they differ or were recently modified.
#[derive(Debug)]
pub struct BackupJobBuilder {
    config: Config,
    source: Box<dyn Bucket>,
    destination: Box<dyn Bucket>,
    metrics: Option<Metrics>,
    all: bool,
    tag_deleted: bool,
}

impl BackupJobBuilder {
    pub fn new(config: Config, source: Box<dyn Bucket>, destination: Box<dyn Bucket>) -> Self {
        Self {
            config,
            source,
            destination,
            metrics: None,
            all: false,
            tag_deleted: false,
        }
    }

    /// Validate that both buckets exist and are accessible, and start building a job that backs
    /// up `source` into `destination` with CloudWatch metrics (unless disabled in the config).
    pub async fn from_factory(
        factory: &ObjectStorageFactory,
        config: Config,
        source: &str,
        destination: &str,
    ) -> Result<Self> {
        let (source, destination) = futures::try_join!(
            factory.validated_bucket(source),
            factory.validated_bucket(destination)
        )?;

        Ok(Self::new(config, source, destination).metrics(factory.metrics()))
    }

    /// Copy every object, without comparing to what's already in the destination
    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    /// Tag objects in the destination whose source has been deleted
    pub fn tag_deleted(mut self, tag_deleted: bool) -> Self {
        self.tag_deleted = tag_deleted;
        self
    }

    /// Publish metrics with `metrics`.  If not set, metrics are only logged.
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// List the objects in both buckets and work out what needs to be done, but don't do it yet.
    ///
    /// For big buckets listing can take minutes.
    #[instrument(skip(self), fields(source = self.source.name(), destination = self.destination.name()))]
    pub async fn build(self) -> Result<BackupJob> {
        let prefix = self.config.prefix.as_deref();
        let limit = self.config.objects_count;

        let source_keys = self
            .source
            .list_keys(prefix, limit)
            .await
            .with_context(|_| crate::error::ListKeysSnafu {
                bucket: self.source.name().to_string(),
            })?;

        let source_truncated = limit.map_or(false, |limit| source_keys.len() >= limit);
        let source_count = source_keys.len();

        let (plan, destination_count) = if self.all {
            (BackupPlan::copy_all(source_keys), None)
        } else {
            let destination_keys = self
                .destination
                .list_keys(prefix, None)
                .await
                .with_context(|_| crate::error::ListKeysSnafu {
                    bucket: self.destination.name().to_string(),
                })?;

            let count = destination_keys.len();
            (BackupPlan::new(source_keys, destination_keys), Some(count))
        };

        debug!(
            source_count,
            ?destination_count,
            to_copy = plan.to_copy.len(),
            to_compare = plan.to_compare.len(),
            to_tag = plan.to_tag.len(),
            "Listed both buckets"
        );

        let tag_deleted = if self.tag_deleted && self.all {
            warn!("Tagging deleted objects is not supported when copying all objects; skipping");
            false
        } else if self.tag_deleted && source_truncated {
            warn!(
                objects_count = limit,
                "Source listing was truncated; not tagging deleted objects"
            );
            false
        } else {
            self.tag_deleted
        };

        let metrics = self.metrics.unwrap_or_else(|| {
            Metrics::new(
                &self.config.metrics_namespace,
                &self.config.metrics_dimension,
                crate::LogSink,
            )
        });

        Ok(BackupJob {
            config: self.config,
            source: self.source,
            destination: self.destination,
            metrics,
            plan,
            source_count,
            tag_deleted,
        })
    }
}

/// What a backup did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupSummary {
    /// Number of keys listed in the source
    pub source_objects: usize,

    pub compare: StageReport,
    pub copy: StageReport,

    /// `None` if tagging deleted objects wasn't enabled (or was skipped)
    pub tag_deleted: Option<StageReport>,
}

impl BackupSummary {
    pub fn copied(&self) -> usize {
        self.copy.processed
    }

    /// Number of objects newly tagged as deleted
    pub fn tagged_deleted(&self) -> usize {
        self.tag_deleted.map_or(0, |report| report.processed)
    }

    /// Number of objects given up on after too many failed attempts, in any stage
    pub fn abandoned(&self) -> usize {
        self.compare.abandoned
            + self.copy.abandoned
            + self.tag_deleted.map_or(0, |report| report.abandoned)
    }
}

/// A backup ready to run, created by [`BackupJobBuilder::build`]
#[derive(Debug)]
pub struct BackupJob {
    config: Config,
    source: Box<dyn Bucket>,
    destination: Box<dyn Bucket>,
    metrics: Metrics,
    plan: BackupPlan,
    source_count: usize,
    tag_deleted: bool,
}

impl BackupJob {
    /// Number of objects that will be copied without comparing them
    pub fn objects_to_copy(&self) -> usize {
        self.plan.to_copy.len()
    }

    pub fn objects_to_compare(&self) -> usize {
        self.plan.to_compare.len()
    }

    /// Number of objects only in the destination, which are tagged if tagging deleted objects is
    /// enabled
    pub fn objects_to_tag(&self) -> usize {
        self.plan.to_tag.len()
    }

    /// Run the backup.
    ///
    /// If the `abort` future completes, it's a signal that the job should be aborted.  In-flight
    /// requests are abandoned, nothing is rolled back, and this method returns
    /// [`crate::S3BrError::Interrupted`].
    pub async fn run(self, abort: impl Future<Output = ()>) -> Result<BackupSummary> {
        stage::run_until_aborted(abort, |cancel| self.run_pipeline(cancel)).await
    }

    #[instrument(skip_all, fields(source = self.source.name(), destination = self.destination.name()))]
    async fn run_pipeline(self, cancel: CancellationToken) -> Result<BackupSummary> {
        let compare_queue = WorkQueue::new();
        let copy_queue = WorkQueue::new();

        for key in self.plan.to_compare {
            compare_queue.push_key(key);
        }
        for key in self.plan.to_copy {
            copy_queue.push_key(key);
        }

        info!(
            to_compare = compare_queue.len(),
            to_copy = copy_queue.len(),
            "Starting backup"
        );

        self.metrics
            .publish_depth(Metric::ObjectsToCompare, compare_queue.len())
            .await;
        self.metrics
            .publish_depth(Metric::ObjectsToCopy, copy_queue.len())
            .await;

        let compare = Stage::new(
            CompareOperation::new(
                self.source.clone(),
                self.destination.clone(),
                self.config.last_modified_hours,
                self.config.compare_etags,
            ),
            compare_queue,
            &self.config,
            self.metrics.clone(),
        )
        .forward_to(copy_queue.clone())
        .run(&cancel)
        .await?;

        let copy = Stage::new(
            CopyOperation::new(self.source.clone(), self.destination.clone()),
            copy_queue,
            &self.config,
            self.metrics.clone(),
        )
        .run(&cancel)
        .await?;

        let tag_deleted = if self.tag_deleted {
            let tag_queue = WorkQueue::new();
            for key in self.plan.to_tag {
                tag_queue.push_key(key);
            }

            let report = Stage::new(
                TagDeletedOperation::new(self.destination.clone()),
                tag_queue,
                &self.config,
                self.metrics.clone(),
            )
            .run(&cancel)
            .await?;

            info!(tagged = report.processed, "Tagged deleted objects");

            Some(report)
        } else {
            None
        };

        let summary = BackupSummary {
            source_objects: self.source_count,
            compare,
            copy,
            tag_deleted,
        };

        info!(
            copied = summary.copied(),
            tagged_deleted = summary.tagged_deleted(),
            "Backup complete"
        );

        Ok(summary)
    }
}

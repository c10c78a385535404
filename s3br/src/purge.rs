//! Deleting the contents of a bucket, typically a backup that's no longer needed
use crate::objstore::{Bucket, ObjectStorageFactory};
use crate::{Config, Result};
use snafu::prelude::*;
use std::future::Future;
use tracing::{info, instrument, warn};

/// Deletes every object under the configured prefix in a bucket, and optionally the bucket itself
#[derive(Debug)]
pub struct PurgeJob {
    prefix: Option<String>,
    bucket: Box<dyn Bucket>,
    include_versions: bool,
    delete_bucket: bool,
}

/// What a purge did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    /// Objects, or object versions and delete markers if versions were included, that were deleted
    pub deleted: usize,
    pub bucket_deleted: bool,
}

impl PurgeJob {
    pub fn new(config: &Config, bucket: Box<dyn Bucket>) -> Self {
        Self {
            prefix: config.prefix.clone(),
            bucket,
            include_versions: false,
            delete_bucket: false,
        }
    }

    /// Validate that the bucket exists and is accessible and create a purge job for it
    pub async fn from_factory(
        factory: &ObjectStorageFactory,
        config: &Config,
        bucket: &str,
    ) -> Result<Self> {
        Ok(Self::new(config, factory.validated_bucket(bucket).await?))
    }

    /// Also delete every old version and delete marker, so nothing at all is left behind in a
    /// versioned bucket
    pub fn include_versions(mut self, include_versions: bool) -> Self {
        self.include_versions = include_versions;
        self
    }

    /// Delete the bucket once it's empty.  Requires that no prefix is configured, otherwise
    /// objects outside the prefix would keep the bucket from being deleted anyway.
    pub fn delete_bucket(mut self, delete_bucket: bool) -> Self {
        self.delete_bucket = delete_bucket;
        self
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    /// Run the purge.  Anything deleted before `abort` completes stays deleted.
    #[instrument(skip_all, fields(bucket = self.bucket.name(), prefix = ?self.prefix))]
    pub async fn run(self, abort: impl Future<Output = ()>) -> Result<PurgeSummary> {
        tokio::select! {
            result = self.purge() => result,
            _ = abort => crate::error::InterruptedSnafu.fail(),
        }
    }

    async fn purge(&self) -> Result<PurgeSummary> {
        let deleted = self
            .bucket
            .delete_objects(self.prefix.as_deref(), self.include_versions)
            .await
            .with_context(|_| crate::error::PurgeObjectsSnafu {
                bucket: self.bucket.name().to_string(),
            })?;

        info!(deleted, "Deleted objects");

        let bucket_deleted = if self.delete_bucket && self.prefix.is_none() {
            self.bucket
                .delete_bucket()
                .await
                .with_context(|_| crate::error::DeleteBucketSnafu {
                    bucket: self.bucket.name().to_string(),
                })?;

            info!("Deleted bucket");
            true
        } else {
            if self.delete_bucket {
                warn!("A prefix is configured, so the bucket itself is not deleted");
            }

            false
        };

        Ok(PurgeSummary {
            deleted,
            bucket_deleted,
        })
    }
}

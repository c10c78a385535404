use crate::{Config, Metrics, RemoteError, Result};
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use std::collections::BTreeMap;

mod s3;

/// Tags attached to an object, keyed by tag name
pub type TagSet = BTreeMap<String, String>;

/// What a HEAD of an object tells us about it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,

    /// The storage class, ie `GLACIER`.  S3 omits this for objects in the `STANDARD` class.
    pub storage_class: Option<String>,

    pub e_tag: Option<String>,

    /// The raw value of the `x-amz-restore` header, present only if a restore of an archived
    /// object has been requested.  Looks like `ongoing-request="true"` while the restore runs.
    pub restore: Option<String>,
}

impl ObjectMetadata {
    /// Is this object in a storage class whose contents can't be read until it's restored?
    ///
    /// `GLACIER_IR` is not included, it's readable like any other class.
    pub fn is_archived(&self) -> bool {
        matches!(
            self.storage_class.as_deref(),
            Some("GLACIER") | Some("DEEP_ARCHIVE")
        )
    }

    /// Is this object archived and not (yet) readable, either because no restore was requested
    /// or because the restore is still running?
    pub fn awaiting_thaw(&self) -> bool {
        if !self.is_archived() {
            return false;
        }

        match self.restore.as_deref() {
            None => true,
            Some(restore) => restore.contains("ongoing-request=\"true\""),
        }
    }
}

/// A bucket in S3 or an S3-compatible object store.
///
/// Every per-object operation fails with a [`RemoteError`], whose kind tells the caller whether
/// retrying makes sense.
///
/// Use [`ObjectStorageFactory`] to get S3 implementations of this trait.  Tests provide their own
/// in-memory implementations.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// List the keys of all objects, optionally only those starting with `prefix`.
    ///
    /// If `limit` is given, listing stops as soon as that many keys are known and exactly `limit`
    /// keys are returned (or fewer, if there aren't that many objects).
    async fn list_keys(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, RemoteError>;

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata, RemoteError>;

    /// Server-side copy of the object `key` in the bucket named `source_bucket` into this bucket,
    /// under the same key
    async fn copy_object_from(&self, source_bucket: &str, key: &str) -> Result<(), RemoteError>;

    async fn get_tags(&self, key: &str) -> Result<TagSet, RemoteError>;

    /// Replace the tags of an object
    async fn put_tags(&self, key: &str, tags: TagSet) -> Result<(), RemoteError>;

    /// Delete every object, optionally only those starting with `prefix`.
    ///
    /// With `include_versions`, every version and delete marker is deleted too, which leaves no
    /// trace of the objects in a versioned bucket.  Returns the number of objects (or versions)
    /// deleted.
    async fn delete_objects(
        &self,
        prefix: Option<&str>,
        include_versions: bool,
    ) -> Result<usize, RemoteError>;

    /// Does the bucket exist?  A bucket we're denied access to is an error, not `false`.
    async fn exists(&self) -> Result<bool, RemoteError>;

    /// Delete the bucket itself, which must be empty
    async fn delete_bucket(&self) -> Result<(), RemoteError>;
}

dyn_clone::clone_trait_object!(Bucket);

/// Append the keys of one page of a listing to `keys`, honoring `limit`.
///
/// Returns `true` if the limit was reached, meaning listing should stop without fetching any
/// further pages.
pub(crate) fn take_keys(
    keys: &mut Vec<String>,
    page: impl IntoIterator<Item = String>,
    limit: Option<usize>,
) -> bool {
    match limit {
        None => {
            keys.extend(page);
            false
        }
        Some(limit) => {
            let remaining = limit.saturating_sub(keys.len());
            keys.extend(page.into_iter().take(remaining));

            keys.len() >= limit
        }
    }
}

/// Creates the S3 clients that back [`Bucket`] implementations and CloudWatch metrics, based on
/// the AWS settings in the [`Config`].
///
/// Credentials are resolved once, when the factory is created, so that missing or invalid
/// credentials are reported before any work starts.
#[derive(Clone, Debug)]
pub struct ObjectStorageFactory {
    config: Config,
    sdk_config: aws_types::SdkConfig,
    s3_client: aws_sdk_s3::Client,
}

impl ObjectStorageFactory {
    pub async fn new(config: Config) -> Result<Self> {
        let sdk_config = s3::load_sdk_config(&config).await?;
        let s3_client = s3::make_s3_client(&config, &sdk_config);

        Ok(Self {
            config,
            sdk_config,
            s3_client,
        })
    }

    /// Get a bucket without checking that it exists
    pub fn bucket(&self, name: &str) -> Box<dyn Bucket> {
        Box::new(s3::S3Bucket::new(
            name,
            self.s3_client.clone(),
            self.config.clone(),
        ))
    }

    /// Get a bucket, failing if it doesn't exist or we have no access to it
    pub async fn validated_bucket(&self, name: &str) -> Result<Box<dyn Bucket>> {
        let bucket = self.bucket(name);

        validate_bucket(bucket.as_ref()).await?;

        Ok(bucket)
    }

    /// The metrics publisher for a job: CloudWatch, unless metrics are disabled in the config
    pub fn metrics(&self) -> Metrics {
        if self.config.disable_metrics {
            Metrics::new(
                &self.config.metrics_namespace,
                &self.config.metrics_dimension,
                crate::metrics::LogSink,
            )
        } else {
            Metrics::new(
                &self.config.metrics_namespace,
                &self.config.metrics_dimension,
                crate::metrics::CloudWatchSink::new(aws_sdk_cloudwatch::Client::new(
                    &self.sdk_config,
                )),
            )
        }
    }
}

/// Fail with [`crate::S3BrError::BucketInvalidOrNotAccessible`] unless the bucket exists and is
/// accessible
pub(crate) async fn validate_bucket(bucket: &dyn Bucket) -> Result<()> {
    use snafu::IntoError;

    let error = match bucket.exists().await {
        Ok(true) => return Ok(()),
        Ok(false) => RemoteError::new(
            crate::ErrorKind::NotFound,
            "HeadBucket",
            bucket.name(),
            "bucket does not exist",
        ),
        Err(e) => e,
    };

    Err(crate::error::BucketInvalidOrNotAccessibleSnafu {
        bucket: bucket.name().to_string(),
    }
    .into_error(error))
}

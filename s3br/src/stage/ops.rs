//! The operations applied to each key by the stages of backup and restore
use super::{Outcome, StageOperation};
use crate::metrics::Metric;
use crate::objstore::{Bucket, ObjectMetadata, TagSet};
use crate::{ErrorKind, RemoteError};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Tag set on backed up objects that no longer exist in the source
pub(crate) const DELETED_TAG: &str = "Deleted";

/// Tag recording when [`DELETED_TAG`] was set
pub(crate) const DELETED_AT_TAG: &str = "DeletedAt";

const DELETED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Copies each key from the source bucket to the destination bucket
#[derive(Debug)]
pub(crate) struct CopyOperation {
    source: Box<dyn Bucket>,
    destination: Box<dyn Bucket>,
}

impl CopyOperation {
    pub(crate) fn new(source: Box<dyn Bucket>, destination: Box<dyn Bucket>) -> Self {
        Self {
            source,
            destination,
        }
    }

    async fn copy(&self, key: &str) -> Result<Outcome, RemoteError> {
        self.destination
            .copy_object_from(self.source.name(), key)
            .await?;

        debug!(key, "Copied");

        Ok(Outcome::Processed)
    }
}

#[async_trait::async_trait]
impl StageOperation for CopyOperation {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn depth_metric(&self) -> Metric {
        Metric::ObjectsToCopy
    }

    fn error_metric(&self) -> Metric {
        Metric::BackupObjectsErrors
    }

    fn default_workers(&self) -> usize {
        25
    }

    async fn execute(&self, key: &str) -> Result<Outcome, RemoteError> {
        self.copy(key).await
    }
}

/// Compares each key present in both buckets, forwarding the keys that need to be copied again
#[derive(Debug)]
pub(crate) struct CompareOperation {
    source: Box<dyn Bucket>,
    destination: Box<dyn Bucket>,

    /// Source objects modified after this are always copied
    modified_cutoff: DateTime<Utc>,
    compare_etags: bool,
}

impl CompareOperation {
    pub(crate) fn new(
        source: Box<dyn Bucket>,
        destination: Box<dyn Bucket>,
        last_modified_hours: u64,
        compare_etags: bool,
    ) -> Self {
        let hours = i64::try_from(last_modified_hours).unwrap_or(i64::MAX);
        let modified_cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::hours(hours))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            source,
            destination,
            modified_cutoff,
            compare_etags,
        }
    }
}

/// Does the destination copy of an object need to be replaced by the source?
pub(crate) fn needs_copy(
    source: &ObjectMetadata,
    destination: &ObjectMetadata,
    modified_cutoff: DateTime<Utc>,
    compare_etags: bool,
) -> bool {
    if source.size != destination.size {
        return true;
    }

    if compare_etags && source.e_tag != destination.e_tag {
        return true;
    }

    // An object with an unknown modification time is treated as recently modified
    source
        .last_modified
        .map_or(true, |modified| modified > modified_cutoff)
}

#[async_trait::async_trait]
impl StageOperation for CompareOperation {
    fn name(&self) -> &'static str {
        "compare"
    }

    fn depth_metric(&self) -> Metric {
        Metric::ObjectsToCompare
    }

    fn error_metric(&self) -> Metric {
        Metric::CompareObjectsErrors
    }

    fn default_workers(&self) -> usize {
        5
    }

    async fn execute(&self, key: &str) -> Result<Outcome, RemoteError> {
        let (source, destination) = futures::join!(
            self.source.head_object(key),
            self.destination.head_object(key)
        );

        let source = match source {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key, "Object was deleted from the source after listing");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let destination = match destination {
            Ok(destination) => destination,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key, "Object was deleted from the destination after listing");
                return Ok(Outcome::Forward);
            }
            Err(e) => return Err(e),
        };

        if needs_copy(
            &source,
            &destination,
            self.modified_cutoff,
            self.compare_etags,
        ) {
            Ok(Outcome::Forward)
        } else {
            Ok(Outcome::Skipped)
        }
    }
}

/// Tags backed up objects whose source was deleted
#[derive(Debug)]
pub(crate) struct TagDeletedOperation {
    destination: Box<dyn Bucket>,
}

impl TagDeletedOperation {
    pub(crate) fn new(destination: Box<dyn Bucket>) -> Self {
        Self { destination }
    }
}

/// The tags to put on an object to mark it deleted at `now`, or `None` if it's already marked
pub(crate) fn mark_deleted(tags: &TagSet, now: DateTime<Utc>) -> Option<TagSet> {
    if tags.contains_key(DELETED_TAG) || tags.contains_key(DELETED_AT_TAG) {
        return None;
    }

    let mut tags = tags.clone();
    tags.insert(DELETED_TAG.to_string(), "True".to_string());
    tags.insert(
        DELETED_AT_TAG.to_string(),
        now.format(DELETED_AT_FORMAT).to_string(),
    );

    Some(tags)
}

/// Is the object tagged as deleted from the backup's source?
pub(crate) fn is_tagged_deleted(tags: &TagSet) -> bool {
    tags.get(DELETED_TAG).map(String::as_str) == Some("True")
}

#[async_trait::async_trait]
impl StageOperation for TagDeletedOperation {
    fn name(&self) -> &'static str {
        "tag-deleted"
    }

    fn depth_metric(&self) -> Metric {
        Metric::ObjectsToTagAsDeleted
    }

    fn error_metric(&self) -> Metric {
        Metric::TagDeletedObjectsErrors
    }

    fn default_workers(&self) -> usize {
        10
    }

    fn slow_polling(&self) -> bool {
        true
    }

    async fn execute(&self, key: &str) -> Result<Outcome, RemoteError> {
        let tags = self.destination.get_tags(key).await?;

        match mark_deleted(&tags, Utc::now()) {
            Some(tags) => {
                self.destination.put_tags(key, tags).await?;
                debug!(key, "Tagged as deleted");

                Ok(Outcome::Processed)
            }
            None => Ok(Outcome::Skipped),
        }
    }
}

/// Forwards the keys of objects not tagged as deleted to the restore stage
#[derive(Debug)]
pub(crate) struct CheckDeletedTagOperation {
    source: Box<dyn Bucket>,
}

impl CheckDeletedTagOperation {
    pub(crate) fn new(source: Box<dyn Bucket>) -> Self {
        Self { source }
    }
}

#[async_trait::async_trait]
impl StageOperation for CheckDeletedTagOperation {
    fn name(&self) -> &'static str {
        "check-deleted-tag"
    }

    fn depth_metric(&self) -> Metric {
        Metric::ObjectsToCheckForDeletedTag
    }

    fn error_metric(&self) -> Metric {
        Metric::CheckDeletedTagErrors
    }

    fn default_workers(&self) -> usize {
        25
    }

    fn slow_polling(&self) -> bool {
        true
    }

    async fn execute(&self, key: &str) -> Result<Outcome, RemoteError> {
        let tags = self.source.get_tags(key).await?;

        if is_tagged_deleted(&tags) {
            debug!(key, "Tagged as deleted, not restoring");
            Ok(Outcome::Skipped)
        } else {
            Ok(Outcome::Forward)
        }
    }
}

/// Copies objects back out of a backup, waiting for archived objects to be thawed first
#[derive(Debug)]
pub(crate) struct RestoreOperation {
    copy: CopyOperation,
}

impl RestoreOperation {
    pub(crate) fn new(source: Box<dyn Bucket>, destination: Box<dyn Bucket>) -> Self {
        Self {
            copy: CopyOperation::new(source, destination),
        }
    }
}

#[async_trait::async_trait]
impl StageOperation for RestoreOperation {
    fn name(&self) -> &'static str {
        "restore"
    }

    fn depth_metric(&self) -> Metric {
        Metric::ObjectsToRestore
    }

    fn error_metric(&self) -> Metric {
        Metric::RestoreObjectsErrors
    }

    fn default_workers(&self) -> usize {
        25
    }

    fn slow_polling(&self) -> bool {
        true
    }

    async fn execute(&self, key: &str) -> Result<Outcome, RemoteError> {
        let metadata = self.copy.source.head_object(key).await?;

        if metadata.awaiting_thaw() {
            debug!(
                key,
                storage_class = ?metadata.storage_class,
                restore = ?metadata.restore,
                "Object is archived and not thawed yet"
            );

            return Ok(Outcome::NotReady);
        }

        self.copy.copy(key).await
    }
}

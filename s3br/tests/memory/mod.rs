//! An in-memory object store implementing [`s3br::Bucket`], with hooks for injecting failures and
//! simulating archived objects.
//!
//! This lets the backup and restore pipelines be tested end to end, including retries and thaw
//! waits, without minio and in milliseconds.
use chrono::{DateTime, Utc};
use s3br::{Bucket, ErrorKind, ObjectMetadata, RemoteError, TagSet};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

mod backup;
mod restore;

#[derive(Clone, Debug, Default)]
pub struct MemoryObject {
    pub size: u64,
    pub e_tag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    pub restore: Option<String>,
    pub tags: TagSet,

    /// For archived objects: how many more HEADs report the object as still thawing before the
    /// restore completes
    pub thaw_after_heads: Option<usize>,
}

impl MemoryObject {
    /// An object that hasn't been modified in a long time
    pub fn old(size: u64, e_tag: &str) -> Self {
        Self {
            size,
            e_tag: e_tag.to_string(),
            last_modified: Some(Utc::now() - chrono::Duration::days(30)),
            ..Default::default()
        }
    }

    /// An object archived to glacier with a restore in progress that completes after `heads` HEAD
    /// requests
    pub fn thawing(size: u64, heads: usize) -> Self {
        Self {
            storage_class: Some("GLACIER".to_string()),
            restore: Some("ongoing-request=\"true\"".to_string()),
            thaw_after_heads: Some(heads),
            ..Self::old(size, "\"archived\"")
        }
    }

    fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            size: self.size,
            last_modified: self.last_modified,
            storage_class: self.storage_class.clone(),
            e_tag: Some(self.e_tag.clone()),
            restore: self.restore.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct BucketState {
    objects: BTreeMap<String, MemoryObject>,
}

#[derive(Debug, Default)]
struct StoreState {
    buckets: HashMap<String, BucketState>,

    /// Errors to return from the next calls of an operation on a key, keyed by (operation, key)
    failures: HashMap<(&'static str, String), VecDeque<ErrorKind>>,

    /// Number of successful calls of each operation, keyed by (operation, key)
    calls: HashMap<(&'static str, String), usize>,

    /// Number of `exists` calls on a missing bucket after which it is created
    create_bucket_after: HashMap<String, usize>,
}

/// A collection of in-memory buckets.  Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn create_bucket(&self, name: &str) -> Box<dyn Bucket> {
        self.lock().buckets.entry(name.to_string()).or_default();
        self.bucket(name)
    }

    /// A handle to a bucket, which may or may not exist
    pub fn bucket(&self, name: &str) -> Box<dyn Bucket> {
        Box::new(MemoryBucket {
            store: self.clone(),
            name: name.to_string(),
        })
    }

    /// Make a missing bucket appear after it was checked for `checks` times
    pub fn create_bucket_after(&self, name: &str, checks: usize) {
        self.lock()
            .create_bucket_after
            .insert(name.to_string(), checks);
    }

    pub fn put(&self, bucket: &str, key: &str, object: MemoryObject) {
        self.lock()
            .buckets
            .get_mut(bucket)
            .expect("bucket exists")
            .objects
            .insert(key.to_string(), object);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<MemoryObject> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|bucket| bucket.objects.get(key).cloned())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|bucket| bucket.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.lock().buckets.contains_key(bucket)
    }

    /// Make the next calls of `operation` on `key` fail, one call per error kind
    pub fn fail(&self, operation: &'static str, key: &str, kinds: impl IntoIterator<Item = ErrorKind>) {
        self.lock()
            .failures
            .entry((operation, key.to_string()))
            .or_default()
            .extend(kinds);
    }

    /// How many times `operation` succeeded on `key`
    pub fn calls(&self, operation: &'static str, key: &str) -> usize {
        self.lock()
            .calls
            .get(&(operation, key.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Return an injected error for this call if there is one, otherwise count the call
    fn check(&self, operation: &'static str, key: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let id = (operation, key.to_string());

        if let Some(kind) = state.failures.get_mut(&id).and_then(VecDeque::pop_front) {
            return Err(RemoteError::new(kind, operation, key, "injected failure"));
        }

        *state.calls.entry(id).or_default() += 1;

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct MemoryBucket {
    store: MemoryStore,
    name: String,
}

impl MemoryBucket {
    fn not_found(&self, operation: &'static str, key: &str) -> RemoteError {
        RemoteError::new(
            ErrorKind::NotFound,
            operation,
            format!("{}/{key}", self.name),
            "no such key",
        )
    }

    fn with_bucket<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut BucketState) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = self.store.lock();

        match state.buckets.get_mut(&self.name) {
            Some(bucket) => f(bucket),
            None => Err(RemoteError::new(
                ErrorKind::NotFound,
                operation,
                &self.name,
                "no such bucket",
            )),
        }
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_keys(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, RemoteError> {
        self.store.check("ListObjectsV2", &self.name)?;

        self.with_bucket("ListObjectsV2", |bucket| {
            Ok(bucket
                .objects
                .keys()
                .filter(|key| prefix.map_or(true, |prefix| key.starts_with(prefix)))
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect())
        })
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata, RemoteError> {
        self.store.check("HeadObject", key)?;

        self.with_bucket("HeadObject", |bucket| {
            let object = bucket
                .objects
                .get_mut(key)
                .ok_or_else(|| self.not_found("HeadObject", key))?;

            match object.thaw_after_heads.as_mut() {
                Some(0) => {
                    object.restore = Some("ongoing-request=\"false\"".to_string());
                    object.thaw_after_heads = None;
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }

            Ok(object.metadata())
        })
    }

    async fn copy_object_from(&self, source_bucket: &str, key: &str) -> Result<(), RemoteError> {
        self.store.check("CopyObject", key)?;

        let mut state = self.store.lock();

        let object = state
            .buckets
            .get(source_bucket)
            .and_then(|bucket| bucket.objects.get(key))
            .cloned()
            .ok_or_else(|| self.not_found("CopyObject", key))?;

        if object.storage_class.is_some() && object.restore.as_deref() != Some("ongoing-request=\"false\"") {
            return Err(RemoteError::new(
                ErrorKind::Unclassified,
                "CopyObject",
                key,
                "InvalidObjectState: object is archived",
            ));
        }

        let destination = state
            .buckets
            .get_mut(&self.name)
            .ok_or_else(|| self.not_found("CopyObject", key))?;

        // A copy gets a fresh modification time, and no archival state or tags
        destination.objects.insert(
            key.to_string(),
            MemoryObject {
                size: object.size,
                e_tag: object.e_tag,
                last_modified: Some(Utc::now()),
                ..Default::default()
            },
        );

        Ok(())
    }

    async fn get_tags(&self, key: &str) -> Result<TagSet, RemoteError> {
        self.store.check("GetObjectTagging", key)?;

        self.with_bucket("GetObjectTagging", |bucket| {
            bucket
                .objects
                .get(key)
                .map(|object| object.tags.clone())
                .ok_or_else(|| self.not_found("GetObjectTagging", key))
        })
    }

    async fn put_tags(&self, key: &str, tags: TagSet) -> Result<(), RemoteError> {
        self.store.check("PutObjectTagging", key)?;

        self.with_bucket("PutObjectTagging", |bucket| {
            let object = bucket
                .objects
                .get_mut(key)
                .ok_or_else(|| self.not_found("PutObjectTagging", key))?;

            object.tags = tags;

            Ok(())
        })
    }

    async fn delete_objects(
        &self,
        prefix: Option<&str>,
        _include_versions: bool,
    ) -> Result<usize, RemoteError> {
        self.store.check("DeleteObjects", &self.name)?;

        self.with_bucket("DeleteObjects", |bucket| {
            let before = bucket.objects.len();
            bucket
                .objects
                .retain(|key, _| !prefix.map_or(true, |prefix| key.starts_with(prefix)));

            Ok(before - bucket.objects.len())
        })
    }

    async fn exists(&self) -> Result<bool, RemoteError> {
        self.store.check("HeadBucket", &self.name)?;

        let mut state = self.store.lock();

        if state.buckets.contains_key(&self.name) {
            return Ok(true);
        }

        if let Some(remaining) = state.create_bucket_after.get_mut(&self.name) {
            if *remaining <= 1 {
                state.create_bucket_after.remove(&self.name);
                state.buckets.insert(self.name.clone(), BucketState::default());
            } else {
                *remaining -= 1;
            }
        }

        Ok(false)
    }

    async fn delete_bucket(&self) -> Result<(), RemoteError> {
        self.store.check("DeleteBucket", &self.name)?;

        let mut state = self.store.lock();

        match state.buckets.get(&self.name) {
            None => Err(self.not_found("DeleteBucket", &self.name)),
            Some(bucket) if !bucket.objects.is_empty() => Err(RemoteError::new(
                ErrorKind::Unclassified,
                "DeleteBucket",
                &self.name,
                "BucketNotEmpty",
            )),
            Some(_) => {
                state.buckets.remove(&self.name);
                Ok(())
            }
        }
    }
}

/// Config for tests against the in-memory store: tiny backoff and polling intervals so that
/// retries don't slow the tests down
pub fn test_config() -> s3br::Config {
    let mut config = s3br::Config::default();

    config.backoff_unit_ms = 1;
    config.max_wait = 20;
    config.poll_interval_ms = 5;
    config.slow_poll_interval_ms = 5;
    config.bucket_wait_delay_ms = 1;
    config.worker_groups = Some(2);
    config.thread_count = Some(4);
    config.timeout = 5;
    config.disable_metrics = true;

    config
}

use super::{take_keys, Bucket, ObjectMetadata, TagSet};
use crate::credentials::{util, RoleCredentialsProvider};
use crate::{Config, ErrorKind, RemoteError, Result};
use aws_credential_types::{provider::ProvideCredentials, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier, Tag, Tagging,
};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::prelude::*;
use std::{ops::Range, sync::Arc};
use tracing::{debug, instrument, warn, Instrument};

/// S3 refuses multipart uploads with more parts than this
const MAX_PARTS: u64 = 10_000;

/// Characters escaped in the key part of a `CopySource`; path separators stay as they are
const COPY_SOURCE_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Load the AWS SDK config for the settings in `config`, and make sure credentials can be
/// resolved.
pub(super) async fn load_sdk_config(config: &Config) -> Result<aws_types::SdkConfig> {
    let mut sdk_config = sdk_config_loader(config).load().await;

    if let Some(role_arn) = &config.assume_role_arn {
        debug!(%role_arn, "Operating with the credentials of an assumed role");

        let provider =
            RoleCredentialsProvider::new(sdk_config, role_arn, &config.role_session_name);
        sdk_config = sdk_config_loader(config)
            .credentials_provider(provider)
            .load()
            .await;
    }

    if let Some(provider) = sdk_config.credentials_provider() {
        provider
            .provide_credentials()
            .await
            .context(crate::error::CredentialsUnavailableSnafu)?;
    }

    Ok(sdk_config)
}

fn sdk_config_loader(config: &Config) -> aws_config::ConfigLoader {
    let region_provider =
        util::load_region_provider(config.aws_region.as_ref(), config.aws_profile.as_deref());

    let mut loader = aws_config::from_env()
        .region(region_provider)
        .timeout_config(
            aws_config::timeout::TimeoutConfig::builder()
                .operation_attempt_timeout(config.timeout())
                .build(),
        )
        .retry_config(
            aws_config::retry::RetryConfig::standard()
                .with_max_attempts(config.sdk_max_attempts.max(1)),
        );

    if let Some(profile) = &config.aws_profile {
        loader = loader.profile_name(profile);
    }

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(Credentials::from_keys(
            access_key_id,
            secret_access_key,
            config.aws_session_token.clone(),
        ));
    }

    loader
}

pub(super) fn make_s3_client(
    config: &Config,
    sdk_config: &aws_types::SdkConfig,
) -> aws_sdk_s3::Client {
    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(sdk_config);

    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services on a plain host:port can't do virtual-hosted-style bucket
        // addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.to_string())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}

/// Classify an error response from the S3 API by its error code, or its HTTP status if there is no
/// code (responses to HEAD requests have no body, so no code).
pub(crate) fn classify_service_error(code: Option<&str>, status: u16) -> ErrorKind {
    match code {
        Some("SlowDown")
        | Some("Throttling")
        | Some("ThrottlingException")
        | Some("TooManyRequestsException")
        | Some("RequestLimitExceeded")
        | Some("ServiceUnavailable") => ErrorKind::Throttled,
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("NoSuchUpload") | Some("NotFound") => {
            ErrorKind::NotFound
        }
        Some("InternalError") | Some("RequestTimeout") | Some("OperationAborted") => {
            ErrorKind::Transient
        }
        Some(_) => match status {
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Unclassified,
        },
        None => match status {
            // S3 signals `SlowDown` with a 503
            429 | 503 => ErrorKind::Throttled,
            404 => ErrorKind::NotFound,
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Unclassified,
        },
    }
}

fn classify_sdk_error<E: ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>) -> ErrorKind {
    match err {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => ErrorKind::Transient,
        SdkError::DispatchFailure(failure) => {
            if failure.is_user() {
                ErrorKind::Unclassified
            } else {
                // Connection refused, DNS failures, connection resets and timeouts
                ErrorKind::Transient
            }
        }
        SdkError::ServiceError(service_error) => classify_service_error(
            service_error.err().code(),
            service_error.raw().status().as_u16(),
        ),
        _ => ErrorKind::Unclassified,
    }
}

/// Convert an SDK error into a [`RemoteError`], keeping the full error report as the detail
fn remote_error<E>(
    operation: &'static str,
    location: impl Into<String>,
    err: SdkError<E, HttpResponse>,
) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let kind = classify_sdk_error(&err);

    RemoteError::new(
        kind,
        operation,
        location,
        DisplayErrorContext(&err).to_string(),
    )
}

fn build_error(
    operation: &'static str,
    location: impl Into<String>,
    err: aws_smithy_types::error::operation::BuildError,
) -> RemoteError {
    RemoteError::new(ErrorKind::Unclassified, operation, location, err.to_string())
}

/// The `CopySource` of a copy request: the bucket and the URL-encoded key
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_ESCAPES))
}

/// Split an object of `size` bytes into the byte ranges of a multipart copy.
///
/// The parts are `chunk_size` bytes except for the last, unless that would need more than
/// [`MAX_PARTS`] parts, in which case the parts are made bigger.
pub(crate) fn part_ranges(size: u64, chunk_size: u64) -> Vec<Range<u64>> {
    let chunk_size = chunk_size.max(1).max((size + MAX_PARTS - 1) / MAX_PARTS);

    (0..size)
        .step_by(chunk_size as usize)
        .map(|start| start..(start + chunk_size).min(size))
        .collect()
}

/// Implementation of [`Bucket`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,
    client: aws_sdk_s3::Client,
    config: Config,
}

impl S3Bucket {
    pub(super) fn new(name: &str, client: aws_sdk_s3::Client, config: Config) -> Self {
        Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                client,
                config,
            }),
        }
    }

    fn location(&self, key: &str) -> String {
        format!("{}/{}", self.inner.name, key)
    }

    /// Copy an object too big for a single `CopyObject` call using the multipart upload APIs.
    ///
    /// If any part fails the multipart upload is aborted, so no orphaned parts keep incurring
    /// storage charges.
    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn multipart_copy(
        &self,
        copy_source: &str,
        key: &str,
        size: u64,
    ) -> Result<(), RemoteError> {
        let upload = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .map_err(|e| remote_error("CreateMultipartUpload", self.location(key), e))?;

        let upload_id = upload.upload_id().ok_or_else(|| {
            RemoteError::new(
                ErrorKind::Unclassified,
                "CreateMultipartUpload",
                self.location(key),
                "response is missing the upload ID",
            )
        })?;

        let result = self
            .copy_parts_and_complete(copy_source, key, upload_id, size)
            .await;

        if result.is_err() {
            debug!(upload_id, "Aborting multipart copy");

            if let Err(e) = self
                .inner
                .client
                .abort_multipart_upload()
                .bucket(&self.inner.name)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(upload_id, err = %DisplayErrorContext(&e), "Failed to abort multipart copy");
            }
        }

        result
    }

    async fn copy_parts_and_complete(
        &self,
        copy_source: &str,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<(), RemoteError> {
        let chunk_size = self.inner.config.multipart_chunk_size.get_bytes() as u64;
        let ranges = part_ranges(size, chunk_size);

        debug!(
            parts = ranges.len(),
            size, "Commencing multipart copy"
        );

        let part_futs = ranges.into_iter().enumerate().map(|(index, range)| {
            // S3 numbers parts from 1
            let part_number = index as i32 + 1;
            let span = tracing::debug_span!("copy part", part_number);

            async move {
                let response = self
                    .inner
                    .client
                    .upload_part_copy()
                    .bucket(&self.inner.name)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .copy_source(copy_source)
                    .copy_source_range(format!("bytes={}-{}", range.start, range.end - 1))
                    .send()
                    .await
                    .map_err(|e| remote_error("UploadPartCopy", self.location(key), e))?;

                let e_tag = response
                    .copy_part_result()
                    .and_then(|result| result.e_tag())
                    .ok_or_else(|| {
                        RemoteError::new(
                            ErrorKind::Unclassified,
                            "UploadPartCopy",
                            self.location(key),
                            format!("response for part {part_number} is missing the ETag"),
                        )
                    })?;

                Ok(CompletedPart::builder()
                    .e_tag(e_tag)
                    .part_number(part_number)
                    .build())
            }
            .instrument(span)
        });

        // Honor the configured max parallel requests for the parts of this one object
        let mut parts = futures::stream::iter(part_futs)
            .buffer_unordered(self.inner.config.max_concurrent_requests.max(1));

        let mut completed_parts = Vec::new();
        while let Some(result) = parts.next().await {
            completed_parts.push(result?);
        }
        drop(parts);

        // S3 requires the parts in order of part number
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| remote_error("CompleteMultipartUpload", self.location(key), e))?;

        Ok(())
    }

    /// Delete one batch of at most 1000 objects, returning how many were deleted
    async fn delete_batch(&self, objects: Vec<ObjectIdentifier>) -> Result<usize, RemoteError> {
        if objects.is_empty() {
            return Ok(0);
        }

        let count = objects.len();
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| build_error("DeleteObjects", &self.inner.name, e))?;

        let output = self
            .inner
            .client
            .delete_objects()
            .bucket(&self.inner.name)
            .delete(delete)
            .send()
            .await
            .map_err(|e| remote_error("DeleteObjects", &self.inner.name, e))?;

        // In quiet mode only the objects that could not be deleted are reported
        if let Some(first) = output.errors().first() {
            return Err(RemoteError::new(
                ErrorKind::Unclassified,
                "DeleteObjects",
                self.location(first.key().unwrap_or_default()),
                format!(
                    "{} objects could not be deleted, first error: {} {}",
                    output.errors().len(),
                    first.code().unwrap_or_default(),
                    first.message().unwrap_or_default()
                ),
            ));
        }

        debug!(bucket = %self.inner.name, count, "Deleted batch of objects");

        Ok(count)
    }

    async fn delete_current_objects(&self, prefix: Option<&str>) -> Result<usize, RemoteError> {
        let mut pages = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .set_prefix(prefix.map(str::to_string))
            .into_paginator()
            .send();

        let mut deleted = 0;
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| remote_error("ListObjectsV2", &self.inner.name, e))?;

            let objects = page
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| build_error("DeleteObjects", self.location(key), e))
                })
                .collect::<Result<Vec<_>, _>>()?;

            deleted += self.delete_batch(objects).await?;
        }

        Ok(deleted)
    }

    async fn delete_all_versions(&self, prefix: Option<&str>) -> Result<usize, RemoteError> {
        let mut key_marker = None;
        let mut version_id_marker = None;
        let mut deleted = 0;

        loop {
            let page = self
                .inner
                .client
                .list_object_versions()
                .bucket(&self.inner.name)
                .set_prefix(prefix.map(str::to_string))
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_id_marker.take())
                .send()
                .await
                .map_err(|e| remote_error("ListObjectVersions", &self.inner.name, e))?;

            let versions = page
                .versions()
                .iter()
                .map(|version| (version.key(), version.version_id()));
            let delete_markers = page
                .delete_markers()
                .iter()
                .map(|marker| (marker.key(), marker.version_id()));

            let objects = versions
                .chain(delete_markers)
                .filter_map(|(key, version_id)| key.map(|key| (key, version_id)))
                .map(|(key, version_id)| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .set_version_id(version_id.map(str::to_string))
                        .build()
                        .map_err(|e| build_error("DeleteObjects", self.location(key), e))
                })
                .collect::<Result<Vec<_>, _>>()?;

            deleted += self.delete_batch(objects).await?;

            if page.is_truncated() != Some(true) {
                break;
            }

            key_marker = page.next_key_marker().map(str::to_string);
            version_id_marker = page.next_version_id_marker().map(str::to_string);
        }

        Ok(deleted)
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn list_keys(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, RemoteError> {
        let mut pages = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .set_prefix(prefix.map(str::to_string))
            .set_max_keys(limit.map(|limit| limit.min(1000) as i32))
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| remote_error("ListObjectsV2", &self.inner.name, e))?;

            let page_keys = page
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .map(str::to_string);

            if take_keys(&mut keys, page_keys, limit) {
                debug!(count = keys.len(), "Object count limit reached; listing stopped early");
                break;
            }
        }

        debug!(count = keys.len(), "Listed keys");

        Ok(keys)
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata, RemoteError> {
        // Helpfully, the AWS Rust SDK provides conversions from their own internal DateTime type
        // to Chrono.
        use aws_smithy_types_convert::date_time::DateTimeExt;

        let output = self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .map_err(|e| remote_error("HeadObject", self.location(key), e))?;

        Ok(ObjectMetadata {
            size: output.content_length().unwrap_or_default().max(0) as u64,
            last_modified: output
                .last_modified()
                .and_then(|timestamp| timestamp.to_chrono_utc().ok()),
            storage_class: output
                .storage_class()
                .map(|class| class.as_str().to_string()),
            e_tag: output.e_tag().map(str::to_string),
            restore: output.restore().map(str::to_string),
        })
    }

    async fn copy_object_from(&self, source_bucket: &str, key: &str) -> Result<(), RemoteError> {
        let size = self
            .inner
            .client
            .head_object()
            .bucket(source_bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| remote_error("HeadObject", format!("{source_bucket}/{key}"), e))?
            .content_length()
            .unwrap_or_default()
            .max(0) as u64;

        let copy_source = copy_source(source_bucket, key);

        if size >= self.inner.config.multipart_threshold.get_bytes() as u64 {
            self.multipart_copy(&copy_source, key, size).await
        } else {
            debug!(bucket = %self.inner.name, key, size, "Copying object");

            self.inner
                .client
                .copy_object()
                .bucket(&self.inner.name)
                .key(key)
                .copy_source(copy_source)
                .send()
                .await
                .map_err(|e| remote_error("CopyObject", self.location(key), e))?;

            Ok(())
        }
    }

    async fn get_tags(&self, key: &str) -> Result<TagSet, RemoteError> {
        let output = self
            .inner
            .client
            .get_object_tagging()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .map_err(|e| remote_error("GetObjectTagging", self.location(key), e))?;

        Ok(output
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }

    async fn put_tags(&self, key: &str, tags: TagSet) -> Result<(), RemoteError> {
        let tag_set = tags
            .into_iter()
            .map(|(name, value)| {
                Tag::builder()
                    .key(name)
                    .value(value)
                    .build()
                    .map_err(|e| build_error("PutObjectTagging", self.location(key), e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| build_error("PutObjectTagging", self.location(key), e))?;

        self.inner
            .client
            .put_object_tagging()
            .bucket(&self.inner.name)
            .key(key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| remote_error("PutObjectTagging", self.location(key), e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn delete_objects(
        &self,
        prefix: Option<&str>,
        include_versions: bool,
    ) -> Result<usize, RemoteError> {
        if include_versions {
            self.delete_all_versions(prefix).await
        } else {
            self.delete_current_objects(prefix).await
        }
    }

    async fn exists(&self) -> Result<bool, RemoteError> {
        match self
            .inner
            .client
            .head_bucket()
            .bucket(&self.inner.name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = remote_error("HeadBucket", &self.inner.name, e);
                if err.kind() == ErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete_bucket(&self) -> Result<(), RemoteError> {
        self.inner
            .client
            .delete_bucket()
            .bucket(&self.inner.name)
            .send()
            .await
            .map_err(|e| remote_error("DeleteBucket", &self.inner.name, e))?;

        Ok(())
    }
}

use snafu::prelude::*;

pub type Result<T, E = S3BrError> = std::result::Result<T, E>;

/// Errors that abort a whole backup, restore or purge run.
///
/// Failures of individual per-object operations never surface here; those are [`RemoteError`]s,
/// which the stage workers handle by requeueing the object and backing off.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum S3BrError {
    #[snafu(display("Unable to resolve AWS credentials"))]
    CredentialsUnavailable {
        source: aws_credential_types::provider::error::CredentialsError,
    },

    #[snafu(display("Error assuming IAM role '{role_arn}'"))]
    AssumeRole {
        role_arn: String,
        source: aws_sdk_sts::error::SdkError<
            aws_sdk_sts::operation::assume_role::AssumeRoleError,
            aws_smithy_runtime_api::client::orchestrator::HttpResponse,
        >,
    },

    #[snafu(display("Assuming IAM role '{role_arn}' succeeded but STS returned no credentials"))]
    AssumeRoleNoCredentials { role_arn: String },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible { bucket: String, source: RemoteError },

    #[snafu(display(
        "The destination bucket '{bucket}' still doesn't exist after waiting {cycles} cycles"
    ))]
    DestinationBucketMissing { bucket: String, cycles: usize },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}'"))]
    ListKeys { bucket: String, source: RemoteError },

    #[snafu(display("Error deleting objects from S3 bucket '{bucket}'"))]
    PurgeObjects { bucket: String, source: RemoteError },

    #[snafu(display("Error deleting S3 bucket '{bucket}'"))]
    DeleteBucket { bucket: String, source: RemoteError },

    #[snafu(display("Error publishing metric '{metric}'"))]
    PutMetric {
        metric: String,
        source: aws_sdk_cloudwatch::error::SdkError<
            aws_sdk_cloudwatch::operation::put_metric_data::PutMetricDataError,
            aws_smithy_runtime_api::client::orchestrator::HttpResponse,
        >,
    },

    #[snafu(display("A task in the '{stage}' stage panicked or was cancelled"))]
    StageTaskFailed {
        stage: &'static str,
        source: tokio::task::JoinError,
    },

    #[snafu(display("The operation was interrupted"))]
    Interrupted,
}

/// The broad category of a failed remote call, which decides how a worker reacts to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    /// The object store asked us to slow down
    Throttled,

    /// Connection failures, timeouts and 5xx responses
    Transient,

    NotFound,

    Unclassified,
}

/// A failed call against the object store, tagged with its [`ErrorKind`].
///
/// `detail` holds the full diagnostic text of the underlying SDK error, including all of its
/// sources, because by the time this is logged the original error value is gone.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RemoteError {
    #[snafu(display("{operation} on '{resource}' was throttled: {detail}"))]
    Throttled {
        operation: &'static str,
        resource: String,
        detail: String,
    },

    #[snafu(display("{operation} on '{resource}' failed with a transient error: {detail}"))]
    Transient {
        operation: &'static str,
        resource: String,
        detail: String,
    },

    #[snafu(display("{operation} on '{resource}' failed because it was not found: {detail}"))]
    NotFound {
        operation: &'static str,
        resource: String,
        detail: String,
    },

    #[snafu(display("{operation} on '{resource}' failed: {detail}"))]
    Unclassified {
        operation: &'static str,
        resource: String,
        detail: String,
    },
}

impl RemoteError {
    pub fn new(
        kind: ErrorKind,
        operation: &'static str,
        resource: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        let resource = resource.into();
        let detail = detail.into();

        match kind {
            ErrorKind::Throttled => Self::Throttled {
                operation,
                resource,
                detail,
            },
            ErrorKind::Transient => Self::Transient {
                operation,
                resource,
                detail,
            },
            ErrorKind::NotFound => Self::NotFound {
                operation,
                resource,
                detail,
            },
            ErrorKind::Unclassified => Self::Unclassified {
                operation,
                resource,
                detail,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unclassified { .. } => ErrorKind::Unclassified,
        }
    }

    /// The bucket or `bucket/key` the failed operation was applied to
    pub fn resource(&self) -> &str {
        match self {
            Self::Throttled { resource, .. }
            | Self::Transient { resource, .. }
            | Self::NotFound { resource, .. }
            | Self::Unclassified { resource, .. } => resource,
        }
    }

    /// The name of the remote operation that failed, ie `CopyObject`
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Throttled { operation, .. }
            | Self::Transient { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::Unclassified { operation, .. } => operation,
        }
    }
}

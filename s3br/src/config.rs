use std::time::Duration;
use url::Url;

/// The configuration settings that control the behavior of backup, restore and purge jobs.
///
/// Every setting can be given on the command line or, as a fallback, in an environment variable.
/// Settings that only make sense for one kind of job are not here but are arguments of the
/// corresponding job builder.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Only operate on objects whose keys start with this prefix
    #[cfg_attr(feature = "clap", clap(long, env = "PREFIX", global = true))]
    pub prefix: Option<String>,

    /// Timeout in seconds applied to every remote call attempt, every queue fetch and the final
    /// join of the workers in each stage
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "TIMEOUT", default_value = "30", global = true, value_name = "SECS")
    )]
    pub timeout: u64,

    /// Source objects modified within this many hours are always copied, even if they look
    /// unchanged
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "last-modified-since",
            env = "LAST_MODIFIED_SINCE",
            default_value = "48",
            global = true,
            value_name = "HOURS"
        )
    )]
    pub last_modified_hours: u64,

    /// Also treat objects whose entity tags differ as changed.
    ///
    /// Entity tags of objects uploaded with multipart uploads depend on the chunk size used, so
    /// this can cause unchanged objects to be copied again.
    #[cfg_attr(feature = "clap", clap(long, env = "COMPARE_ETAGS", global = true))]
    pub compare_etags: bool,

    /// The CloudWatch namespace that progress and error metrics are published to
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "CW_NAMESPACE", default_value = "BackupRecovery", global = true)
    )]
    pub metrics_namespace: String,

    /// The name of the CloudWatch dimension that progress and error metrics are published under
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            env = "AWSBatchComputeEnvName",
            default_value = "Dev",
            global = true
        )
    )]
    pub metrics_dimension: String,

    /// Don't publish metrics to CloudWatch, only log them
    #[cfg_attr(feature = "clap", clap(long, env = "DISABLE_METRICS", global = true))]
    pub disable_metrics: bool,

    /// The AWS profile to load credentials and region from
    #[cfg_attr(
        feature = "clap",
        clap(short = 'p', long = "profile", env = "AWS_PROFILE", global = true)
    )]
    pub aws_profile: Option<String>,

    /// The AWS region to use.  If not set the region is taken from the AWS config, or
    /// `eu-central-1` if there is none
    #[cfg_attr(feature = "clap", clap(long = "region", env = "AWS_REGION", global = true))]
    pub aws_region: Option<String>,

    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// Static access key ID, which takes precedence over the profile and the environment
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true, global = true)
    )]
    pub aws_access_key_id: Option<String>,

    /// Static secret access key, required if `aws_access_key_id` is set
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true, global = true)
    )]
    pub aws_secret_access_key: Option<String>,

    /// Session token that goes with the static access key, if any
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "AWS_SESSION_TOKEN", hide_env_values = true, global = true)
    )]
    pub aws_session_token: Option<String>,

    /// Assume this IAM role, using the credentials otherwise configured, and operate with the
    /// role's temporary credentials.  The credentials are refreshed before they expire.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "ASSUME_ROLE_ARN", global = true, value_name = "ARN")
    )]
    pub assume_role_arn: Option<String>,

    /// Session name used when assuming `assume_role_arn`
    #[cfg_attr(feature = "clap", clap(long, default_value = "s3br", global = true))]
    pub role_session_name: String,

    /// The chunk size that s3br uses for multipart copies of individual objects.
    ///
    /// Multipart copies will be used for objects larger than `multipart_threshold`.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    ///
    /// Note that the maximum number of chunks in an upload is 10,000, so for very large objects
    /// this chunk size may be overridden if it's smaller than 1/10,000th of the size of the
    /// object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "25MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The size threshold s3br uses for multipart copies of individual objects.
    ///
    /// If an object is this size or larger, then it will be copied in chunks of
    /// `multipart_chunk_size` bytes each.  S3 refuses single-request copies of objects over 5GB,
    /// so this must not be larger than that.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "50MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,

    /// The maximum number of concurrent part copies in flight for a single multipart copy
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// Number of workers per worker group.  If not set each stage uses its own default
    #[cfg_attr(feature = "clap", clap(long, env = "THREAD_COUNT", global = true))]
    pub thread_count: Option<usize>,

    /// Number of worker groups per stage.  Defaults to the number of CPUs
    #[cfg_attr(feature = "clap", clap(long, env = "WORKER_GROUPS", global = true))]
    pub worker_groups: Option<usize>,

    /// Ceiling for the backoff wait of a worker, in backoff units
    #[cfg_attr(feature = "clap", clap(long, default_value = "300", global = true))]
    pub max_wait: u64,

    /// Length in milliseconds of one backoff unit
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "1000", global = true, value_name = "MILLIS")
    )]
    pub backoff_unit_ms: u64,

    /// Grow the backoff wait deterministically instead of choosing a random wait below the
    /// ceiling
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub no_jitter: bool,

    /// How often the compare and copy stages check whether their queue has drained, in
    /// milliseconds
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "1000", global = true, value_name = "MILLIS")
    )]
    pub poll_interval_ms: u64,

    /// How often the tag, check-deleted-tag and restore stages check whether their queue has
    /// drained, in milliseconds
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "60000", global = true, value_name = "MILLIS")
    )]
    pub slow_poll_interval_ms: u64,

    /// Debugging aid: stop listing the source bucket after this many objects
    #[cfg_attr(feature = "clap", clap(long, env = "OBJECTS_COUNT", global = true))]
    pub objects_count: Option<usize>,

    /// Give up on an object after it failed this many times.  If not set, failing objects are
    /// retried until they succeed.
    #[cfg_attr(feature = "clap", clap(long, env = "MAX_ATTEMPTS", global = true))]
    pub max_attempts: Option<usize>,

    /// Number of attempts the AWS SDK itself makes for each request before reporting a failure
    #[cfg_attr(feature = "clap", clap(long, default_value = "3", global = true))]
    pub sdk_max_attempts: u32,

    /// How many cycles a restore waits for the destination bucket to exist
    #[cfg_attr(feature = "clap", clap(long, default_value = "60", global = true))]
    pub bucket_wait_cycles: usize,

    /// How many times the destination bucket is checked in each wait cycle
    #[cfg_attr(feature = "clap", clap(long, default_value = "12", global = true))]
    pub bucket_wait_attempts: usize,

    /// Delay between two checks for the destination bucket, in milliseconds
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "5000", global = true, value_name = "MILLIS")
    )]
    pub bucket_wait_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            prefix: None,
            timeout: 30,
            last_modified_hours: 48,
            compare_etags: false,
            metrics_namespace: "BackupRecovery".to_string(),
            metrics_dimension: "Dev".to_string(),
            disable_metrics: false,
            aws_profile: None,
            aws_region: None,
            s3_endpoint: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            assume_role_arn: None,
            role_session_name: "s3br".to_string(),
            multipart_chunk_size: byte_unit::Byte::from_bytes(25 * 1024 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(50 * 1024 * 1024),
            max_concurrent_requests: 10,
            thread_count: None,
            worker_groups: None,
            max_wait: 300,
            backoff_unit_ms: 1000,
            no_jitter: false,
            poll_interval_ms: 1000,
            slow_poll_interval_ms: 60_000,
            objects_count: None,
            max_attempts: None,
            sdk_max_attempts: 3,
            bucket_wait_cycles: 60,
            bucket_wait_attempts: 12,
            bucket_wait_delay_ms: 5000,
        }
    }
}

impl Config {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn slow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slow_poll_interval_ms)
    }

    pub(crate) fn bucket_wait_delay(&self) -> Duration {
        Duration::from_millis(self.bucket_wait_delay_ms)
    }

    /// Number of worker groups each stage runs, when not explicitly configured
    pub(crate) fn worker_groups(&self) -> usize {
        self.worker_groups.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

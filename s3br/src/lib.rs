#![doc = include_str!("../README.md")]

mod backoff;
mod backup;
mod config;
mod credentials;
mod error;
mod keys;
mod metrics;
mod objstore;
mod purge;
mod queue;
mod restore;
mod stage;

pub use backoff::{decay, next_wait};
pub use backup::*;
pub use config::Config;
pub use error::{ErrorKind, RemoteError, Result, S3BrError};
pub use metrics::{CloudWatchSink, LogSink, Metric, Metrics, MetricsSink, ZERO_SUBSTITUTE};
pub use objstore::{Bucket, ObjectMetadata, ObjectStorageFactory, TagSet};
pub use purge::*;
pub use restore::*;
pub use stage::StageReport;

//! Progress and error metrics.
//!
//! Metrics are the only way to observe a long running job besides the logs.  Queue depths are
//! published at the start and end of every stage and every time a stage coordinator polls its
//! queue.  Failures publish an error metric specific to the stage, or `SlowDown` when the object
//! store throttled the request.
use crate::Result;
use snafu::prelude::*;
use std::{fmt::Debug, sync::Arc};
use tracing::{debug, warn};

/// Value published in place of zero.
///
/// The dashboards and alarms built on these metrics treat a datapoint of exactly 0 as missing
/// data, so zero is never sent.
pub const ZERO_SUBSTITUTE: f64 = 0.1;

/// The names of every metric s3br publishes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum Metric {
    ObjectsToCompare,
    ObjectsToCopy,
    ObjectsToTagAsDeleted,
    ObjectsToCheckForDeletedTag,
    ObjectsToRestore,
    CompareObjectsErrors,
    BackupObjectsErrors,
    TagDeletedObjectsErrors,
    CheckDeletedTagErrors,
    RestoreObjectsErrors,
    SlowDown,
}

/// Somewhere to send metric values to.
///
/// Implementations must be trivially cloneable or wrapped in an `Arc`; a single sink is shared by
/// every worker in a job.
#[async_trait::async_trait]
pub trait MetricsSink: Debug + Sync + Send + 'static {
    async fn put_metric(
        &self,
        namespace: &str,
        dimension: &str,
        metric: Metric,
        value: f64,
    ) -> Result<()>;
}

/// [`MetricsSink`] that publishes to CloudWatch.
///
/// Each value is sent as a statistic set with a single sample, at one second resolution, with a
/// dimension named after the configured dimension whose value is the metric name.
#[derive(Clone, Debug)]
pub struct CloudWatchSink {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchSink {
    pub fn new(client: aws_sdk_cloudwatch::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl MetricsSink for CloudWatchSink {
    async fn put_metric(
        &self,
        namespace: &str,
        dimension: &str,
        metric: Metric,
        value: f64,
    ) -> Result<()> {
        let name: &'static str = metric.into();
        let datum = metric_datum(dimension, metric, value);

        self.client
            .put_metric_data()
            .namespace(namespace)
            .metric_data(datum)
            .send()
            .await
            .context(crate::error::PutMetricSnafu { metric: name })?;

        Ok(())
    }
}

/// A single-sample statistic set at one second resolution, under a dimension whose value is the
/// metric name
fn metric_datum(
    dimension: &str,
    metric: Metric,
    value: f64,
) -> aws_sdk_cloudwatch::types::MetricDatum {
    use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit, StatisticSet};

    let name: &'static str = metric.into();

    MetricDatum::builder()
        .metric_name(name)
        .dimensions(Dimension::builder().name(dimension).value(name).build())
        .statistic_values(
            StatisticSet::builder()
                .sample_count(value)
                .sum(value)
                .minimum(value)
                .maximum(value)
                .build(),
        )
        .unit(StandardUnit::Count)
        .storage_resolution(1)
        .build()
}

/// [`MetricsSink`] that only logs the metrics at debug level, for when publishing is disabled
#[derive(Clone, Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl MetricsSink for LogSink {
    async fn put_metric(
        &self,
        namespace: &str,
        dimension: &str,
        metric: Metric,
        value: f64,
    ) -> Result<()> {
        debug!(namespace, dimension, %metric, value, "Metric");

        Ok(())
    }
}

/// Publishes metrics under a fixed namespace and dimension.
///
/// Publishing never fails: errors from the sink are logged and otherwise ignored, because losing
/// a datapoint is much better than failing a backup over it.
#[derive(Clone, Debug)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    namespace: String,
    dimension: String,
    sink: Box<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(
        namespace: impl Into<String>,
        dimension: impl Into<String>,
        sink: impl MetricsSink,
    ) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                namespace: namespace.into(),
                dimension: dimension.into(),
                sink: Box::new(sink),
            }),
        }
    }

    /// Publish a value, substituting [`ZERO_SUBSTITUTE`] for zero
    pub async fn publish(&self, metric: Metric, value: f64) {
        let value = substitute_zero(value);

        if let Err(e) = self
            .inner
            .sink
            .put_metric(&self.inner.namespace, &self.inner.dimension, metric, value)
            .await
        {
            warn!(%metric, value, err = ?e, "Failed to publish metric");
        }
    }

    /// Publish the number of items waiting in a queue
    pub async fn publish_depth(&self, metric: Metric, depth: usize) {
        self.publish(metric, depth as f64).await
    }

    /// Count one occurrence of an error
    pub async fn count(&self, metric: Metric) {
        self.publish(metric, 1.0).await
    }
}

fn substitute_zero(value: f64) -> f64 {
    if value == 0.0 {
        ZERO_SUBSTITUTE
    } else {
        value
    }
}

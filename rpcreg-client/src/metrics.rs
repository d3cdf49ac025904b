//! # Call metrics
//!
//! Prometheus counters per call, labelled by `grpc_type`, `grpc_service` and
//! `grpc_method`, plus an optional latency histogram. Server side:
//!
//! - `grpc_server_started_total`
//! - `grpc_server_handled_total` (extra `code` label)
//! - `grpc_server_msg_received_total`, `grpc_server_msg_sent_total`
//! - `grpc_server_handled_latency_seconds`
//!
//! The client side mirrors these as `grpc_client_started_total`,
//! `grpc_client_completed`, `grpc_client_msg_received_total`,
//! `grpc_client_msg_sent_total` and `grpc_client_completed_latency_seconds`.
//!
//! Message counters only count the streaming directions of a call.
use crate::conf::MetricsConfig;
use crate::error::MetricsConfigurationError;
use crate::rpc::{MethodDescriptor, StatusCode};
use dashmap::DashMap;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;
use tokio::time::Instant;

const NAMESPACE: &str = "grpc";
const METHOD_LABELS: [&str; 3] = ["grpc_type", "grpc_service", "grpc_method"];
const HANDLED_LABELS: [&str; 4] = ["grpc_type", "grpc_service", "grpc_method", "code"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    fn subsystem(&self) -> &'static str {
        match self {
            Side::Server => "server",
            Side::Client => "client",
        }
    }

    fn handled_name(&self) -> &'static str {
        match self {
            Side::Server => "handled_total",
            Side::Client => "completed",
        }
    }

    fn latency_name(&self) -> &'static str {
        match self {
            Side::Server => "handled_latency_seconds",
            Side::Client => "completed_latency_seconds",
        }
    }

    fn started_help(&self) -> &'static str {
        match self {
            Side::Server => "Total number of RPCs started on the server.",
            Side::Client => "Total number of RPCs started by the client.",
        }
    }

    fn handled_help(&self) -> &'static str {
        match self {
            Side::Server => "Total number of RPCs completed on the server, regardless of success or failure.",
            Side::Client => "Total number of RPCs completed by the client, regardless of success or failure.",
        }
    }

    fn latency_help(&self) -> &'static str {
        match self {
            Side::Server => "Histogram of response latency of RPCs handled by the server, in seconds.",
            Side::Client => "Histogram of response latency of RPCs completed by the client, in seconds.",
        }
    }
}

/// Collectors of one side, registered once at startup.
pub struct MetricsFactory {
    side: Side,
    started: IntCounterVec,
    handled: IntCounterVec,
    msg_received: IntCounterVec,
    msg_sent: IntCounterVec,
    latency: Option<HistogramVec>,
    methods: DashMap<MethodDescriptor, Arc<MethodMetrics>>,
}

impl MetricsFactory {
    /// Create the collectors of `side` and register them into `registry`.
    ///
    /// Fails on invalid latency buckets or when the collectors are already
    /// registered there.
    pub fn new(
        side: Side,
        config: &MetricsConfig,
        registry: &Registry,
    ) -> Result<Self, MetricsConfigurationError> {
        let latency = if config.enable_latency_histograms {
            validate_buckets(&config.latency_buckets)?;
            let opts = HistogramOpts::new(side.latency_name(), side.latency_help())
                .namespace(NAMESPACE)
                .subsystem(side.subsystem())
                .buckets(config.latency_buckets.clone());
            Some(HistogramVec::new(opts, &METHOD_LABELS)?)
        } else {
            None
        };
        let started = counter(side, "started_total", side.started_help(), &METHOD_LABELS)?;
        let handled = counter(side, side.handled_name(), side.handled_help(), &HANDLED_LABELS)?;
        let msg_received = counter(
            side,
            "msg_received_total",
            "Total number of stream messages received.",
            &METHOD_LABELS,
        )?;
        let msg_sent = counter(
            side,
            "msg_sent_total",
            "Total number of stream messages sent.",
            &METHOD_LABELS,
        )?;

        registry.register(Box::new(started.clone()))?;
        registry.register(Box::new(handled.clone()))?;
        registry.register(Box::new(msg_received.clone()))?;
        registry.register(Box::new(msg_sent.clone()))?;
        if let Some(latency) = &latency {
            registry.register(Box::new(latency.clone()))?;
        }
        log::info!(
            "{} call metrics registered, latency histogram {}",
            side.subsystem(),
            if latency.is_some() { "on" } else { "off" }
        );

        Ok(MetricsFactory {
            side,
            started,
            handled,
            msg_received,
            msg_sent,
            latency,
            methods: DashMap::new(),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Handles of `method`, created on first use.
    pub fn for_method(&self, method: &MethodDescriptor) -> Arc<MethodMetrics> {
        if let Some(metrics) = self.methods.get(method) {
            return metrics.clone();
        }
        self.methods
            .entry(method.clone())
            .or_insert_with(|| {
                let labels = [
                    method.kind.as_str(),
                    method.service.as_str(),
                    method.method.as_str(),
                ];
                Arc::new(MethodMetrics {
                    side: self.side,
                    method: method.clone(),
                    started: self.started.with_label_values(&labels),
                    handled: self.handled.clone(),
                    msg_received: self.msg_received.with_label_values(&labels),
                    msg_sent: self.msg_sent.with_label_values(&labels),
                    latency: self
                        .latency
                        .as_ref()
                        .map(|h| h.with_label_values(&labels)),
                })
            })
            .clone()
    }
}

impl std::fmt::Debug for MetricsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsFactory")
            .field("side", &self.side)
            .field("latency", &self.latency.is_some())
            .finish_non_exhaustive()
    }
}

fn counter(
    side: Side,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, MetricsConfigurationError> {
    let opts = Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(side.subsystem());
    Ok(IntCounterVec::new(opts, labels)?)
}

fn validate_buckets(buckets: &[f64]) -> Result<(), MetricsConfigurationError> {
    if buckets.is_empty() {
        return Err(MetricsConfigurationError::InvalidBuckets(
            "at least one bucket is required".to_string(),
        ));
    }
    if let Some(b) = buckets.iter().find(|b| !b.is_finite() || **b < 0.0) {
        return Err(MetricsConfigurationError::InvalidBuckets(format!(
            "bucket {} is not a finite non-negative number",
            b
        )));
    }
    if let Some(w) = buckets.windows(2).find(|w| w[0] >= w[1]) {
        return Err(MetricsConfigurationError::InvalidBuckets(format!(
            "buckets must be strictly increasing, got {} then {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// Metric handles of one method.
pub struct MethodMetrics {
    side: Side,
    method: MethodDescriptor,
    started: IntCounter,
    handled: IntCounterVec,
    msg_received: IntCounter,
    msg_sent: IntCounter,
    latency: Option<Histogram>,
}

impl MethodMetrics {
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn record_started(&self) {
        self.started.inc();
    }

    pub fn record_handled(&self, code: StatusCode) {
        let labels = [
            self.method.kind.as_str(),
            self.method.service.as_str(),
            self.method.method.as_str(),
            code.as_str(),
        ];
        match self.handled.get_metric_with_label_values(&labels) {
            Ok(counter) => counter.inc(),
            Err(e) => log::warn!("record completion of {:?} error: {}", self.method, e),
        }
    }

    /// Count one message received, if the incoming direction is a stream.
    ///
    /// A server receives requests, a client receives responses.
    pub fn record_message_received(&self) {
        let streamed = match self.side {
            Side::Server => self.method.kind.streams_requests(),
            Side::Client => self.method.kind.streams_responses(),
        };
        if streamed {
            self.msg_received.inc();
        }
    }

    /// Count one message sent, if the outgoing direction is a stream.
    pub fn record_message_sent(&self) {
        let streamed = match self.side {
            Side::Server => self.method.kind.streams_responses(),
            Side::Client => self.method.kind.streams_requests(),
        };
        if streamed {
            self.msg_sent.inc();
        }
    }

    pub fn record_latency(&self, seconds: f64) {
        if let Some(latency) = &self.latency {
            latency.observe(seconds);
        }
    }
}

/// Tracks one call from start to completion.
///
/// Creating the monitor counts the call as started. The call is counted as
/// handled exactly once: with the code given to [`finish`](Self::finish), or
/// on drop with `CANCELLED`, or `UNKNOWN` when dropped during a panic.
pub struct CallMonitor {
    metrics: Arc<MethodMetrics>,
    started_at: Instant,
    finished: bool,
}

impl CallMonitor {
    pub fn start(metrics: Arc<MethodMetrics>) -> Self {
        metrics.record_started();
        CallMonitor {
            metrics,
            started_at: Instant::now(),
            finished: false,
        }
    }

    pub fn recorder(&self) -> MessageRecorder {
        MessageRecorder {
            metrics: Some(self.metrics.clone()),
        }
    }

    pub fn finish(mut self, code: StatusCode) {
        self.complete(code);
    }

    fn complete(&mut self, code: StatusCode) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.metrics.record_handled(code);
        self.metrics
            .record_latency(self.started_at.elapsed().as_secs_f64());
    }
}

impl Drop for CallMonitor {
    fn drop(&mut self) {
        let code = if std::thread::panicking() {
            StatusCode::Unknown
        } else {
            StatusCode::Cancelled
        };
        self.complete(code);
    }
}

/// Counts the stream messages of a call. Handed to handlers and invokers.
#[derive(Clone, Default)]
pub struct MessageRecorder {
    metrics: Option<Arc<MethodMetrics>>,
}

impl MessageRecorder {
    /// A recorder that counts nothing.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn message_received(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_message_received();
        }
    }

    pub fn message_sent(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_message_sent();
        }
    }
}

#[cfg(test)]
impl MetricsFactory {
    pub(crate) fn started_count(&self, method: &MethodDescriptor) -> u64 {
        self.started.with_label_values(&labels_of(method)).get()
    }

    pub(crate) fn handled_count(&self, method: &MethodDescriptor, code: StatusCode) -> u64 {
        let [kind, service, name] = labels_of(method);
        self.handled
            .with_label_values(&[kind, service, name, code.as_str()])
            .get()
    }

    pub(crate) fn received_count(&self, method: &MethodDescriptor) -> u64 {
        self.msg_received.with_label_values(&labels_of(method)).get()
    }

    pub(crate) fn sent_count(&self, method: &MethodDescriptor) -> u64 {
        self.msg_sent.with_label_values(&labels_of(method)).get()
    }

    pub(crate) fn latency_count(&self, method: &MethodDescriptor) -> Option<u64> {
        self.latency
            .as_ref()
            .map(|h| h.with_label_values(&labels_of(method)).get_sample_count())
    }
}

#[cfg(test)]
fn labels_of(method: &MethodDescriptor) -> [&str; 3] {
    [
        method.kind.as_str(),
        method.service.as_str(),
        method.method.as_str(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::MetricsConfigBuilder;
    use crate::rpc::CallKind;
    use prometheus::{Encoder, TextEncoder};

    fn exposition(registry: &Registry) -> String {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn histogram_config() -> MetricsConfig {
        MetricsConfigBuilder::default()
            .enable_latency_histograms(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_server_metrics() {
        let registry = Registry::new();
        let factory = MetricsFactory::new(Side::Server, &histogram_config(), &registry).unwrap();
        let method = MethodDescriptor::new(CallKind::Unary, "orders.Orders", "Get");
        let monitor = CallMonitor::start(factory.for_method(&method));
        monitor.finish(StatusCode::Ok);

        let exposition = exposition(&registry);
        assert!(exposition.contains("grpc_server_started_total{"));
        assert!(exposition.contains("grpc_server_handled_total{"));
        assert!(exposition.contains("grpc_server_handled_latency_seconds_bucket{"));
        assert_eq!(factory.started_count(&method), 1);
        assert_eq!(factory.handled_count(&method, StatusCode::Ok), 1);
        assert_eq!(factory.latency_count(&method), Some(1));
    }

    #[test]
    fn test_client_metric_names() {
        let registry = Registry::new();
        let factory =
            MetricsFactory::new(Side::Client, &MetricsConfig::default(), &registry).unwrap();
        let method = MethodDescriptor::new(CallKind::Unary, "orders.Orders", "Get");
        CallMonitor::start(factory.for_method(&method)).finish(StatusCode::NotFound);

        let exposition = exposition(&registry);
        assert!(exposition.contains("grpc_client_started_total{"));
        assert!(exposition.contains("grpc_client_completed{"));
        assert!(!exposition.contains("latency"));
        assert_eq!(factory.latency_count(&method), None);
        assert_eq!(factory.handled_count(&method, StatusCode::NotFound), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        MetricsFactory::new(Side::Server, &MetricsConfig::default(), &registry).unwrap();
        let err = MetricsFactory::new(Side::Server, &MetricsConfig::default(), &registry)
            .unwrap_err();
        assert!(matches!(err, MetricsConfigurationError::Registration(_)));
        // The other side has its own names.
        MetricsFactory::new(Side::Client, &MetricsConfig::default(), &registry).unwrap();
    }

    #[test]
    fn test_invalid_buckets() {
        for buckets in [vec![], vec![0.1, 0.1], vec![0.5, 0.1], vec![f64::NAN]] {
            let config = MetricsConfigBuilder::default()
                .enable_latency_histograms(true)
                .latency_buckets(buckets)
                .build()
                .unwrap();
            let err = MetricsFactory::new(Side::Server, &config, &Registry::new()).unwrap_err();
            assert!(matches!(err, MetricsConfigurationError::InvalidBuckets(_)));
        }
        // Buckets are not looked at when histograms are off.
        let config = MetricsConfigBuilder::default()
            .latency_buckets(vec![])
            .build()
            .unwrap();
        assert!(MetricsFactory::new(Side::Server, &config, &Registry::new()).is_ok());
    }

    #[test]
    fn test_dropped_monitor_counts_cancelled_once() {
        let factory =
            MetricsFactory::new(Side::Server, &MetricsConfig::default(), &Registry::new()).unwrap();
        let method = MethodDescriptor::new(CallKind::ServerStreaming, "orders.Orders", "List");
        {
            let _monitor = CallMonitor::start(factory.for_method(&method));
        }
        assert_eq!(factory.started_count(&method), 1);
        assert_eq!(factory.handled_count(&method, StatusCode::Cancelled), 1);
        assert_eq!(factory.handled_count(&method, StatusCode::Ok), 0);
    }

    #[test]
    fn test_panic_counts_unknown() {
        let factory = Arc::new(
            MetricsFactory::new(Side::Server, &MetricsConfig::default(), &Registry::new()).unwrap(),
        );
        let method = MethodDescriptor::new(CallKind::Unary, "orders.Orders", "Get");
        let metrics = factory.for_method(&method);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _monitor = CallMonitor::start(metrics);
            panic!("handler bug");
        }));
        assert!(result.is_err());
        assert_eq!(factory.handled_count(&method, StatusCode::Unknown), 1);
        assert_eq!(factory.handled_count(&method, StatusCode::Cancelled), 0);
    }

    #[test]
    fn test_messages_counted_on_streaming_directions() {
        let factory =
            MetricsFactory::new(Side::Server, &MetricsConfig::default(), &Registry::new()).unwrap();
        let unary = MethodDescriptor::new(CallKind::Unary, "orders.Orders", "Get");
        let upload = MethodDescriptor::new(CallKind::ClientStreaming, "orders.Orders", "Upload");

        for method in [&unary, &upload] {
            let monitor = CallMonitor::start(factory.for_method(method));
            let recorder = monitor.recorder();
            recorder.message_received();
            recorder.message_received();
            recorder.message_sent();
            monitor.finish(StatusCode::Ok);
        }
        assert_eq!(factory.received_count(&unary), 0);
        assert_eq!(factory.sent_count(&unary), 0);
        assert_eq!(factory.received_count(&upload), 2);
        assert_eq!(factory.sent_count(&upload), 0);
        MessageRecorder::noop().message_sent();
    }

    #[test]
    fn test_client_counts_its_own_streaming_directions() {
        let factory =
            MetricsFactory::new(Side::Client, &MetricsConfig::default(), &Registry::new()).unwrap();
        let download = MethodDescriptor::new(CallKind::ServerStreaming, "orders.Orders", "Download");
        let upload = MethodDescriptor::new(CallKind::ClientStreaming, "orders.Orders", "Upload");

        let monitor = CallMonitor::start(factory.for_method(&download));
        let recorder = monitor.recorder();
        recorder.message_sent();
        for _ in 0..3 {
            recorder.message_received();
        }
        monitor.finish(StatusCode::Ok);

        let monitor = CallMonitor::start(factory.for_method(&upload));
        let recorder = monitor.recorder();
        recorder.message_sent();
        recorder.message_sent();
        recorder.message_received();
        monitor.finish(StatusCode::Ok);

        assert_eq!(factory.received_count(&download), 3);
        assert_eq!(factory.sent_count(&download), 0);
        assert_eq!(factory.sent_count(&upload), 2);
        assert_eq!(factory.received_count(&upload), 0);
    }
}

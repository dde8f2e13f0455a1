use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use std::time::Duration;

/// Work queue metrics, shared by all queues and labeled by queue name.
#[derive(Clone, Debug)]
pub struct QueueMetrics {
    adds: Family<QueueLabels, Counter>,
    retries: Family<QueueLabels, Counter>,
    depth: Family<QueueLabels, Gauge>,
    processed: Family<ProcessedLabels, Counter>,
    duration: Family<QueueLabels, Histogram, fn() -> Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct QueueLabels {
    queue: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProcessedLabels {
    queue: String,
    result: Outcome,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum Outcome {
    Ok,
    Error,
    Panic,
    Timeout,
}

fn mk_duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let adds = Family::default();
        prom.register("adds", "Count of keys added to the queue", adds.clone());

        let retries = Family::default();
        prom.register(
            "retries",
            "Count of keys requeued with backoff after a failure",
            retries.clone(),
        );

        let depth = Family::default();
        prom.register(
            "depth",
            "Gauge of the number of keys waiting to be processed",
            depth.clone(),
        );

        let processed = Family::default();
        prom.register(
            "processed",
            "Count of processed keys by result",
            processed.clone(),
        );

        let duration = Family::new_with_constructor(mk_duration_histogram as fn() -> Histogram);
        prom.register(
            "process_duration_seconds",
            "Histogram of time spent processing a key",
            duration.clone(),
        );

        Self {
            adds,
            retries,
            depth,
            processed,
            duration,
        }
    }

    pub(crate) fn add(&self, queue: &str) {
        self.adds.get_or_create(&labels(queue)).inc();
    }

    pub(crate) fn retry(&self, queue: &str) {
        self.retries.get_or_create(&labels(queue)).inc();
    }

    pub(crate) fn set_depth(&self, queue: &str, depth: usize) {
        self.depth.get_or_create(&labels(queue)).set(depth as i64);
    }

    pub(crate) fn processed(&self, queue: &str, result: Outcome, elapsed: Duration) {
        self.processed
            .get_or_create(&ProcessedLabels {
                queue: queue.to_string(),
                result,
            })
            .inc();
        self.duration
            .get_or_create(&labels(queue))
            .observe(elapsed.as_secs_f64());
    }
}

fn labels(queue: &str) -> QueueLabels {
    QueueLabels {
        queue: queue.to_string(),
    }
}

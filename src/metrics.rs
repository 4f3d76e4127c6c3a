//! Publish and consume counters.
//!
//! `PublishMetrics` and `ConsumerMetrics` are plain atomics owned by the
//! publisher and worker, readable from tests and health endpoints. With the
//! `otel` feature the same increments are recorded on OpenTelemetry
//! counters, named with dot-separated OTel conventions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Publish outcomes.
#[derive(Debug, Default)]
pub struct PublishMetrics {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl PublishMetrics {
    /// Successful publish calls (not routing keys).
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        otel::PUBLISH_TOTAL.add(1, &[]);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        otel::PUBLISH_FAILED.add(1, &[]);
    }
}

/// How a consumed message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
    /// Could not be decoded. Dead-lettered like a permanent failure but
    /// counted apart.
    Poison,
    /// Unprocessable and rejected without reaching the dead-letter queue.
    Dropped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Requeued => "requeued",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Poison => "poison",
            Outcome::Dropped => "dropped",
        }
    }
}

/// Consume outcomes.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    poison: AtomicU64,
    dropped: AtomicU64,
}

impl ConsumerMetrics {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Decoded messages the handler failed permanently.
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn poison(&self) -> u64 {
        self.poison.load(Ordering::Relaxed)
    }

    /// Messages lost: rejected because dead-lettering was off or failed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Acked => &self.acked,
            Outcome::Requeued => &self.requeued,
            Outcome::DeadLettered => &self.dead_lettered,
            Outcome::Poison => &self.poison,
            Outcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "otel")]
        otel::CONSUME_TOTAL.add(1, &[otel::outcome_attr(outcome.as_str())]);
    }
}

#[cfg(feature = "otel")]
mod otel {
    use std::sync::LazyLock;

    use opentelemetry::metrics::{Counter, Meter};
    use opentelemetry::{global, KeyValue};

    static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("user_form"));

    /// Total successful publish calls.
    pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("user_form.publish.total")
            .with_description("Total successful profile event publishes")
            .build()
    });

    /// Total failed publish calls.
    pub static PUBLISH_FAILED: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("user_form.publish.failed")
            .with_description("Total failed profile event publishes")
            .build()
    });

    /// Total consumed messages, by settlement outcome.
    pub static CONSUME_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("user_form.consume.total")
            .with_description("Total consumed profile events")
            .build()
    });

    pub fn outcome_attr(outcome: &str) -> KeyValue {
        KeyValue::new("outcome", outcome.to_string())
    }
}

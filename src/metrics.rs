use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Shared metrics collector interface
///
/// This is a trait object that allows applications to plug in their own
/// metrics implementations. The IO stack reports every event through it.
pub trait MetricsCollector: Send + Sync {
    fn chunk_read(&self);
    fn chunk_written(&self);
    fn read_before_write(&self);
    fn bytes_read(&self, amount: usize);
    fn bytes_written(&self, amount: usize);
    fn cache_hit(&self);
    fn cache_miss(&self);
    fn deferred_flush(&self, entries: usize);
    fn retry(&self, op: &'static str);
    fn retry_exhausted(&self, op: &'static str);
}

/// No-op metrics collector (default)
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn chunk_read(&self) {}
    fn chunk_written(&self) {}
    fn read_before_write(&self) {}
    fn bytes_read(&self, _amount: usize) {}
    fn bytes_written(&self, _amount: usize) {}
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn deferred_flush(&self, _entries: usize) {}
    fn retry(&self, _op: &'static str) {}
    fn retry_exhausted(&self, _op: &'static str) {}
}

/// Shared reference to metrics collector
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }

    pub fn chunk_read(&self) {
        self.0.chunk_read();
    }

    pub fn chunk_written(&self) {
        self.0.chunk_written();
    }

    pub fn read_before_write(&self) {
        self.0.read_before_write();
    }

    pub fn bytes_read(&self, amount: usize) {
        self.0.bytes_read(amount);
    }

    pub fn bytes_written(&self, amount: usize) {
        self.0.bytes_written(amount);
    }

    pub fn cache_hit(&self) {
        self.0.cache_hit();
    }

    pub fn cache_miss(&self) {
        self.0.cache_miss();
    }

    pub fn deferred_flush(&self, entries: usize) {
        self.0.deferred_flush(entries);
    }

    pub fn retry(&self, op: &'static str) {
        self.0.retry(op);
    }

    pub fn retry_exhausted(&self, op: &'static str) {
        self.0.retry_exhausted(op);
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

/// Prometheus-backed collector. Metrics live in a registry owned by this
/// value, not in the process-wide default registry.
pub struct PrometheusMetrics {
    registry: Registry,
    chunks_read: IntCounter,
    chunks_written: IntCounter,
    reads_before_write: IntCounter,
    bytes_read: IntCounter,
    bytes_written: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    deferred_flushes: IntCounter,
    deferred_entries_flushed: IntCounter,
    retries: IntCounterVec,
    retries_exhausted: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let counter_vec = |name: &str, help: &str| -> Result<IntCounterVec, prometheus::Error> {
            let c = IntCounterVec::new(Opts::new(name, help), &["op"])?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        Ok(Self {
            chunks_read: counter("blobnfs_chunks_read_total", "Object chunks read from the stack")?,
            chunks_written: counter(
                "blobnfs_chunks_written_total",
                "Object chunks written to the stack",
            )?,
            reads_before_write: counter(
                "blobnfs_read_before_write_total",
                "Partial chunk writes that needed the existing chunk",
            )?,
            bytes_read: counter("blobnfs_bytes_read_total", "Logical bytes returned by reads")?,
            bytes_written: counter("blobnfs_bytes_written_total", "Logical bytes written")?,
            cache_hits: counter("blobnfs_cache_hits_total", "IO cache hits")?,
            cache_misses: counter("blobnfs_cache_misses_total", "IO cache misses")?,
            deferred_flushes: counter("blobnfs_deferred_flushes_total", "Deferred write flushes")?,
            deferred_entries_flushed: counter(
                "blobnfs_deferred_entries_flushed_total",
                "Entries written by deferred flushes",
            )?,
            retries: counter_vec("blobnfs_retries_total", "Transient failures retried")?,
            retries_exhausted: counter_vec(
                "blobnfs_retries_exhausted_total",
                "Operations that failed after all retry attempts",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsCollector for PrometheusMetrics {
    fn chunk_read(&self) {
        self.chunks_read.inc();
    }

    fn chunk_written(&self) {
        self.chunks_written.inc();
    }

    fn read_before_write(&self) {
        self.reads_before_write.inc();
    }

    fn bytes_read(&self, amount: usize) {
        self.bytes_read.inc_by(amount as u64);
    }

    fn bytes_written(&self, amount: usize) {
        self.bytes_written.inc_by(amount as u64);
    }

    fn cache_hit(&self) {
        self.cache_hits.inc();
    }

    fn cache_miss(&self) {
        self.cache_misses.inc();
    }

    fn deferred_flush(&self, entries: usize) {
        self.deferred_flushes.inc();
        self.deferred_entries_flushed.inc_by(entries as u64);
    }

    fn retry(&self, op: &'static str) {
        self.retries.with_label_values(&[op]).inc();
    }

    fn retry_exhausted(&self, op: &'static str) {
        self.retries_exhausted.with_label_values(&[op]).inc();
    }
}

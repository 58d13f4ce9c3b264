use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{BackendConfig, BackendKind, StackConfig};
use crate::error::IoError;
use crate::export::StaticExportResolver;
use crate::fs::ExportFs;
use crate::io::{
    DeferredIoOps, FjallIo, IoCache, IoOps, MemoryIo, RecoveryHandler, TimeoutHandler,
    TransactionalIo,
};
use crate::metrics::SharedMetrics;

/// The raw storage under an IO stack.
#[derive(Clone, Debug)]
pub enum Backend {
    Memory(Arc<MemoryIo>),
    Fjall(FjallIo),
}

impl Backend {
    pub fn open(config: &BackendConfig) -> Result<Self, IoError> {
        match config.kind {
            BackendKind::Memory => {
                let io = match config.capacity {
                    Some(capacity) => MemoryIo::with_capacity(capacity),
                    None => MemoryIo::new(),
                };
                Ok(Backend::Memory(Arc::new(io)))
            }
            BackendKind::Fjall => Ok(Backend::Fjall(FjallIo::open(
                &config.path,
                config.durability,
            )?)),
        }
    }

    fn as_io(&self) -> Arc<dyn IoOps> {
        match self {
            Backend::Memory(io) => io.clone(),
            Backend::Fjall(io) => Arc::new(io.clone()),
        }
    }
}

/// Assembles an [`IoStack`] from configuration.
pub struct IoStackBuilder<'a> {
    config: &'a StackConfig,
    backend: Option<Backend>,
    metrics: SharedMetrics,
}

impl<'a> IoStackBuilder<'a> {
    pub fn new(config: &'a StackConfig) -> Self {
        Self {
            config,
            backend: None,
            metrics: SharedMetrics::default(),
        }
    }

    /// Uses an already open backend instead of the configured one.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<IoStack, IoError> {
        let config = self.config;
        let metrics = self.metrics;
        let backend = match self.backend {
            Some(backend) => backend,
            None => Backend::open(&config.backend)?,
        };
        let resolver = Arc::new(StaticExportResolver::new(config.exports.iter().cloned())?);
        let delay = Duration::from_millis(config.retry.delay_ms);

        let mut io: Arc<dyn IoOps> = Arc::new(
            TimeoutHandler::timeout_handler(backend.as_io(), config.retry.timeout_attempts, delay)
                .with_metrics(metrics.clone()),
        );
        io = Arc::new(
            RecoveryHandler::recovery_handler(io, config.retry.recoverable_attempts, delay)
                .with_metrics(metrics.clone()),
        );
        io = Arc::new(TransactionalIo::new(io));
        if config.deferred.enabled {
            io = Arc::new(DeferredIoOps::with_metrics(
                io,
                Duration::from_millis(config.deferred.window_ms),
                config.deferred.max_pending,
                metrics.clone(),
            ));
        }
        if config.cache.enabled {
            io = Arc::new(IoCache::with_metrics(
                io,
                config.cache.metadata_entries,
                config.cache.object_entries,
                metrics.clone(),
            ));
        }

        info!(
            domain = %config.domain,
            backend = ?config.backend.kind,
            cache = config.cache.enabled,
            deferred = config.deferred.enabled,
            exports = config.exports.len(),
            "built io stack"
        );
        Ok(IoStack {
            domain: config.domain.clone(),
            backend,
            io,
            resolver,
            metrics,
        })
    }
}

/// A composed IO stack: cache over deferred writes over per-key
/// transactions over retry proxies over the backend. Cache and deferred
/// writes are optional.
pub struct IoStack {
    domain: String,
    backend: Backend,
    io: Arc<dyn IoOps>,
    resolver: Arc<StaticExportResolver>,
    metrics: SharedMetrics,
}

impl IoStack {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The outermost layer.
    pub fn io(&self) -> Arc<dyn IoOps> {
        self.io.clone()
    }

    pub fn resolver(&self) -> Arc<StaticExportResolver> {
        self.resolver.clone()
    }

    /// The filesystem of the configured exports, over this stack.
    pub async fn export_fs(&self) -> Result<ExportFs, IoError> {
        ExportFs::open(
            self.io(),
            self.domain.as_str(),
            self.resolver.clone(),
            self.metrics.clone(),
        )
        .await
    }

    /// Writes every buffered change through to the backend. Also returns a
    /// write the backend refused in the background and that no operation
    /// has reported yet.
    pub async fn flush(&self) -> Result<(), IoError> {
        self.io.flush().await
    }

    /// Flushes, then drops the stack.
    pub async fn shutdown(self) -> Result<(), IoError> {
        self.flush().await?;
        info!(domain = %self.domain, "io stack shut down");
        Ok(())
    }
}

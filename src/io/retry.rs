use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{IoOps, MetadataMutator, ObjectAndMetadataMutator, ObjectMutator};
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::metrics::SharedMetrics;
use crate::object::FdsObject;

/// When and how often a failed operation is attempted again.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    retry_on: Arc<dyn Fn(&IoError) -> bool + Send + Sync>,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt; zero is treated as one.
    pub fn new(
        max_attempts: u32,
        delay: Duration,
        retry_on: impl Fn(&IoError) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retry_on: Arc::new(retry_on),
        }
    }

    /// Retries [`IoError::Recoverable`] only.
    pub fn recoverable(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, delay, IoError::is_recoverable)
    }

    /// Retries [`IoError::Timeout`] only.
    pub fn timeout(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, delay, IoError::is_timeout)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn should_retry(&self, error: &IoError) -> bool {
        (self.retry_on)(error)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Runs `f` until it succeeds, fails with an error the policy does not
/// retry, or runs out of attempts. The last error is returned unchanged.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, f: F) -> Result<T, IoError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IoError>>,
{
    retry_observed(policy, op, f, |_, _| {}).await
}

/// `observe` sees every retried failure, with `true` for the one that
/// exhausted the attempts.
async fn retry_observed<T, F, Fut, O>(
    policy: &RetryPolicy,
    op: &'static str,
    mut f: F,
    mut observe: O,
) -> Result<T, IoError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IoError>>,
    O: FnMut(&IoError, bool),
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(&e) => {
                if attempt >= policy.max_attempts {
                    observe(&e, true);
                    error!(op, attempts = attempt, error = %e, "retries exhausted");
                    return Err(e);
                }
                observe(&e, false);
                warn!(op, attempt, error = %e, "transient failure, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retries the operations of an inner [`IoOps`] according to a policy.
pub struct RetryProxy {
    inner: Arc<dyn IoOps>,
    policy: RetryPolicy,
    failures: AtomicU64,
    metrics: SharedMetrics,
}

/// A [`RetryProxy`] absorbing [`IoError::Recoverable`] failures.
pub type RecoveryHandler = RetryProxy;

/// A [`RetryProxy`] absorbing [`IoError::Timeout`] failures.
pub type TimeoutHandler = RetryProxy;

impl RetryProxy {
    pub fn new(inner: Arc<dyn IoOps>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            failures: AtomicU64::new(0),
            metrics: SharedMetrics::default(),
        }
    }

    pub fn recovery_handler(inner: Arc<dyn IoOps>, max_attempts: u32, delay: Duration) -> Self {
        Self::new(inner, RetryPolicy::recoverable(max_attempts, delay))
    }

    pub fn timeout_handler(inner: Arc<dyn IoOps>, max_attempts: u32, delay: Duration) -> Self {
        Self::new(inner, RetryPolicy::timeout(max_attempts, delay))
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Transient failures seen so far, including ones that exhausted the
    /// attempts.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, IoError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IoError>>,
    {
        retry_observed(&self.policy, op, f, |_, exhausted| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            if exhausted {
                self.metrics.retry_exhausted(op);
            } else {
                self.metrics.retry(op);
            }
        })
        .await
    }
}

#[async_trait]
impl IoOps for RetryProxy {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        self.call("read_metadata", || self.inner.read_metadata(key))
            .await
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        self.call("write_metadata", || {
            self.inner.write_metadata(key, metadata.clone())
        })
        .await
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        self.call("read_object", || self.inner.read_object(key, max_object_size))
            .await
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        self.call("write_object", || self.inner.write_object(key, object.clone()))
            .await
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        self.call("delete_blob", || self.inner.delete_blob(key)).await
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        self.call("delete_objects_from", || {
            self.inner.delete_objects_from(blob, first)
        })
        .await
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        self.call("rename_blob", || self.inner.rename_blob(key, new_name))
            .await
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        self.call("scan", || self.inner.scan(prefix)).await
    }

    async fn read_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<(Option<FdsObject>, Option<Metadata>), IoError> {
        self.call("read_object_and_metadata", || {
            self.inner.read_object_and_metadata(key, max_object_size)
        })
        .await
    }

    async fn mutate_metadata(
        &self,
        key: &MetaKey,
        mutator: MetadataMutator,
    ) -> Result<Metadata, IoError> {
        self.call("mutate_metadata", || {
            self.inner.mutate_metadata(key, mutator.clone())
        })
        .await
    }

    async fn mutate_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectMutator,
    ) -> Result<FdsObject, IoError> {
        self.call("mutate_object", || {
            self.inner.mutate_object(key, max_object_size, mutator.clone())
        })
        .await
    }

    async fn mutate_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectAndMetadataMutator,
    ) -> Result<(FdsObject, Metadata), IoError> {
        self.call("mutate_object_and_metadata", || {
            self.inner
                .mutate_object_and_metadata(key, max_object_size, mutator.clone())
        })
        .await
    }

    async fn flush(&self) -> Result<(), IoError> {
        self.call("flush", || self.inner.flush()).await
    }

    async fn take_failure(&self, blob: &MetaKey) -> Result<(), IoError> {
        self.inner.take_failure(blob).await
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::IoError;
use crate::io::{IoOps, MetadataMutator};
use crate::keys::{MetaKey, Metadata};

/// Volume under which counter records are stored in the counter's domain.
pub const COUNTERS_VOLUME: &str = ".counters";
const VALUE_FIELD: &str = "value";

/// Named durable integer counters, one per key.
///
/// Each key's value lives in a metadata record, so the last persisted value
/// is picked up again by a counter opened later against the same backend.
/// Every change is one `mutate_metadata` call; with a [`TransactionalIo`]
/// underneath, concurrent changes to the same key never lose an update.
///
/// [`TransactionalIo`]: crate::io::TransactionalIo
pub struct PersistentCounter {
    io: Arc<dyn IoOps>,
    namespace: String,
    name: String,
    start_value: i64,
    signed: bool,
    restored: BTreeMap<String, i64>,
}

impl PersistentCounter {
    /// Opens a counter and reads back the values it persisted before.
    pub async fn open(
        io: Arc<dyn IoOps>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        start_value: i64,
        signed: bool,
    ) -> Result<Self, IoError> {
        if !signed && start_value < 0 {
            return Err(IoError::invalid(format!(
                "unsigned counter cannot start at {}",
                start_value
            )));
        }
        let namespace = namespace.into();
        let name = name.into();

        let record_prefix = format!("{}/", name);
        let prefix = MetaKey::blob_prefix(
            namespace.as_str(),
            COUNTERS_VOLUME,
            record_prefix.as_str(),
        );
        let mut restored = BTreeMap::new();
        for (key, metadata) in io.scan(&prefix).await? {
            let value = parse_value(&metadata)?;
            let Some(counter_key) = key
                .blob_name()
                .and_then(|b| b.strip_prefix(record_prefix.as_str()))
            else {
                continue;
            };
            debug!(counter = %name, key = counter_key, value, "restored counter");
            restored.insert(counter_key.to_string(), value);
        }
        debug!(
            namespace = %namespace,
            counter = %name,
            keys = restored.len(),
            "opened persistent counter"
        );
        Ok(Self {
            io,
            namespace,
            name,
            start_value,
            signed,
            restored,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Values found in the store when the counter was opened, by key.
    pub fn restored(&self) -> &BTreeMap<String, i64> {
        &self.restored
    }

    fn record_key(&self, key: &str) -> MetaKey {
        MetaKey::new(
            self.namespace.as_str(),
            COUNTERS_VOLUME,
            format!("{}/{}", self.name, key),
        )
    }

    /// Adds one and returns the new value.
    pub async fn increment(&self, key: &str) -> Result<i64, IoError> {
        self.add(key, 1).await
    }

    pub async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, IoError> {
        self.add(key, delta).await
    }

    /// Subtracts one and returns the new value.
    pub async fn decrement(&self, key: &str) -> Result<i64, IoError> {
        self.add(key, -1).await
    }

    pub async fn decrement_by(&self, key: &str, delta: i64) -> Result<i64, IoError> {
        let delta = delta
            .checked_neg()
            .ok_or_else(|| IoError::invalid(format!("cannot negate delta {}", delta)))?;
        self.add(key, delta).await
    }

    /// The persisted value, or the start value for a key never changed.
    pub async fn current_value(&self, key: &str) -> Result<i64, IoError> {
        match self.io.read_metadata(&self.record_key(key)).await? {
            Some(metadata) => parse_value(&metadata),
            None => Ok(self.start_value),
        }
    }

    async fn add(&self, key: &str, delta: i64) -> Result<i64, IoError> {
        let start_value = self.start_value;
        let signed = self.signed;
        let mutator: MetadataMutator = Arc::new(move |current: Option<Metadata>| {
            let value = match &current {
                Some(metadata) => parse_value(metadata)?,
                None => start_value,
            };
            let next = value
                .checked_add(delta)
                .ok_or_else(|| IoError::invalid(format!("counter overflow at {}", value)))?;
            if !signed && next < 0 {
                return Err(IoError::invalid(format!(
                    "unsigned counter cannot go below zero (at {}, delta {})",
                    value, delta
                )));
            }
            let mut metadata = current.unwrap_or_default();
            metadata.insert(VALUE_FIELD.to_string(), next.to_string());
            Ok(metadata)
        });

        let metadata = self.io.mutate_metadata(&self.record_key(key), mutator).await?;
        parse_value(&metadata)
    }
}

fn parse_value(metadata: &Metadata) -> Result<i64, IoError> {
    let raw = metadata
        .get(VALUE_FIELD)
        .ok_or_else(|| IoError::Codec("counter record has no value".into()))?;
    raw.parse()
        .map_err(|e| IoError::Codec(format!("counter value {:?}: {}", raw, e)))
}

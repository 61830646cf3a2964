use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

// --- Interfaces ---

/// Write-once key/value store shared by every instance of a fan-out.
///
/// Each key has a single writer: the control instance publishes the roster, every
/// instance publishes its own outcome. Implementations must never overwrite.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stores `value` under `key` unless the key already exists.
    /// Returns `true` when the value was written.
    async fn publish(&self, key: &str, value: Value) -> Result<bool>;

    async fn read(&self, key: &str) -> Result<Option<Value>>;
}

// --- In-Memory Implementation ---

/// Process-local store. Useful for tests and for single-process runs where every
/// instance shares one address space.
#[derive(Default)]
pub struct InMemoryStateStore {
    values: DashMap<String, Value>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn publish(&self, key: &str, value: Value) -> Result<bool> {
        // The entry guard holds the shard lock, so check-and-insert is atomic.
        match self.values.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }
}

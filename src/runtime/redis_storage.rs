use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::ExistenceCheck;
use redis::SetOptions;
use serde_json::Value;

use crate::runtime::storage::StateStore;

/// Shared store for fan-outs whose instances run on different hosts.
///
/// Keys are stored as given; [`StoreContext`](crate::runtime::context::StoreContext)
/// already scopes them under `fanjoin:`.
pub struct RedisStateStore {
    client: redis::Client,
    namespace: Option<String>,
}

impl RedisStateStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            namespace: None,
        }
    }

    /// Prefix every key, e.g. to isolate test runs sharing one database.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// The key as written to Redis.
    pub fn redis_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn publish(&self, key: &str, value: Value) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&value)?;
        // SET NX replies nil when the key exists, which keeps records write-once.
        let options = SetOptions::default().conditional_set(ExistenceCheck::NX);
        let written: Option<String> = conn
            .set_options(self.redis_key(key), serialized, options)
            .await?;
        Ok(written.is_some())
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.redis_key(key)).await?;

        if let Some(s) = raw {
            let val: Value = serde_json::from_str(&s)?;
            Ok(Some(val))
        } else {
            Ok(None)
        }
    }
}

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::storage::StateStore;

/// Store backed by one JSON file per key in a shared directory.
///
/// Lets local sibling processes, which share a filesystem but not memory,
/// publish outcomes the control instance and the downstream join can read.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create store directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 5);
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' {
                name.push(b as char);
            } else {
                name.push_str(&format!("%{:02X}", b));
            }
        }
        name.push_str(".json");
        self.root.join(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn publish(&self, key: &str, value: Value) -> Result<bool> {
        let target = self.path_for(key);
        if tokio::fs::try_exists(&target).await? {
            return Ok(false);
        }

        // Write aside, then hard-link into place: the link fails if the key
        // exists, and readers never observe a half-written file.
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        let bytes = serde_json::to_vec(&value)?;
        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("Failed to write {}", staging.display()))?;

        let linked = tokio::fs::hard_link(&staging, &target).await;
        let _ = tokio::fs::remove_file(&staging).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to publish {}", target.display())),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt record {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

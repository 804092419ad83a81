use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::models::errors::CursorError;

/// Durable storage for one decimal block number per domain.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, domain: &str) -> Result<Option<u64>, CursorError>;
    async fn save(&self, domain: &str, block: u64) -> Result<(), CursorError>;
}

/// One `{domain}.cursor` file per domain under a state directory.
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, domain: &str) -> PathBuf {
        let name: String = domain
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.cursor"))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, domain: &str) -> Result<Option<u64>, CursorError> {
        let path = self.path_for(domain);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CursorError::Io {
                    domain: domain.to_string(),
                    source,
                });
            }
        };

        let value = contents.trim();
        value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CursorError::Corrupt {
                domain: domain.to_string(),
                value: value.to_string(),
            })
    }

    async fn save(&self, domain: &str, block: u64) -> Result<(), CursorError> {
        let io = |source| CursorError::Io {
            domain: domain.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        let path = self.path_for(domain);
        let tmp = path.with_extension("cursor.tmp");

        // Rename keeps the previous value intact if the write is interrupted
        tokio::fs::write(&tmp, block.to_string()).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;
        Ok(())
    }
}

/// In-memory store, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryCursorStore {
    values: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, domain: &str) -> Result<Option<u64>, CursorError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(domain).copied())
    }

    async fn save(&self, domain: &str, block: u64) -> Result<(), CursorError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(domain.to_string(), block);
        Ok(())
    }
}

/// Highest block with a published event, for one domain. Every earlier
/// block is fully published; the cursor block itself is replayed on restart.
pub struct Cursor {
    domain: String,
    last_processed_block: u64,
    store: Arc<dyn CursorStore>,
}

impl Cursor {
    /// Restore from the store, starting at 0 when nothing was persisted.
    pub async fn restore(domain: &str, store: Arc<dyn CursorStore>) -> Result<Self, CursorError> {
        let last_processed_block = store.load(domain).await?.unwrap_or(0);
        info!(
            "Restored cursor for domain {} at block {}",
            domain, last_processed_block
        );
        Ok(Self {
            domain: domain.to_string(),
            last_processed_block,
            store,
        })
    }

    pub fn value(&self) -> u64 {
        self.last_processed_block
    }

    /// Move forward to `block`. Lower or equal values are ignored. The new
    /// value is persisted before it becomes visible.
    pub async fn advance(&mut self, block: u64) -> Result<bool, CursorError> {
        if block <= self.last_processed_block {
            return Ok(false);
        }
        self.store.save(&self.domain, block).await?;
        debug!(
            "Cursor for domain {}: {} -> {}",
            self.domain, self.last_processed_block, block
        );
        self.last_processed_block = block;
        Ok(true)
    }
}

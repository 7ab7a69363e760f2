//! Persistent key-value state: device identity, pinned fingerprints and device tokens.
//!
//! `SledStore` keeps everything in one Sled tree on disk; `MemoryStore` is the in-process
//! equivalent used by tests and ephemeral sessions.

use crate::error::GatewayResult;
use dashmap::DashMap;
use std::path::Path;

const DEFAULT_STORE_PATH: &str = "./data/pagi_talk";
const TREE_NAME: &str = "gateway_client";

/// String key-value storage shared by identity, trust and token bookkeeping.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> GatewayResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> GatewayResult<()>;
    fn remove(&self, key: &str) -> GatewayResult<()>;
}

/// Sled-backed store. Sled is single-writer: one process per path.
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    /// Opens or creates the store at `./data/pagi_talk`.
    pub fn open_default() -> GatewayResult<Self> {
        Self::open_path(DEFAULT_STORE_PATH)
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let value = self.tree.get(key.as_bytes())?;
        Ok(value.map(|iv| String::from_utf8_lossy(&iv).into_owned()))
    }

    fn put(&self, key: &str, value: &str) -> GatewayResult<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> GatewayResult<()> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

/// In-memory store (nothing survives the process).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &str) -> GatewayResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> GatewayResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

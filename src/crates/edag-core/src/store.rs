//! Run result storage
//!
//! Every run publishes its results into a [`ResultStore`], keyed by
//! `(run_id, key)`. The executor owns one store; it doubles as the registry
//! of retained runs, so there is no process-wide state.
//!
//! [`InMemoryResultStore`] is the default. Hosts that want results to
//! outlive the process implement the trait over their own key-value backend;
//! the executor only needs get/put/delete plus the bulk helpers below.
//!
//! ```rust
//! use edag_core::store::{InMemoryResultStore, ResultStore};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! # tokio_test_block(async {
//! let store = InMemoryResultStore::new();
//! let run = Uuid::new_v4();
//!
//! store.put(run, "total", json!(42)).await.unwrap();
//! assert_eq!(store.get(run, "total").await.unwrap(), Some(json!(42)));
//! assert_eq!(store.purge(run).await.unwrap(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Errors raised by a [`ResultStore`]
///
/// [`InMemoryResultStore`] never fails and the executor itself only raises
/// `RunNotFound`. The other variants are for stores over external backends;
/// the executor reports them as [`GraphError::Store`](crate::GraphError::Store).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// A value could not be encoded for, or decoded from, the backend
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backend could not be reached or written
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value storage scoped by run id
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, run_id: Uuid, key: &str) -> Result<Option<Value>>;

    async fn put(&self, run_id: Uuid, key: &str, value: Value) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, run_id: Uuid, key: &str) -> Result<bool>;

    /// Snapshot of every entry of a run; empty when the run is unknown.
    async fn entries(&self, run_id: Uuid) -> Result<Map<String, Value>>;

    /// Drop every entry of a run, returning how many were removed.
    async fn purge(&self, run_id: Uuid) -> Result<usize>;

    /// Runs that currently hold entries.
    async fn runs(&self) -> Result<Vec<Uuid>>;
}

/// Process-local [`ResultStore`]
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    data: Arc<RwLock<HashMap<Uuid, Map<String, Value>>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs holding entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get(&self, run_id: Uuid, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().get(&run_id).and_then(|run| run.get(key)).cloned())
    }

    async fn put(&self, run_id: Uuid, key: &str, value: Value) -> Result<()> {
        self.data
            .write()
            .entry(run_id)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, run_id: Uuid, key: &str) -> Result<bool> {
        let mut data = self.data.write();
        let Some(run) = data.get_mut(&run_id) else {
            return Ok(false);
        };
        let existed = run.remove(key).is_some();
        if run.is_empty() {
            data.remove(&run_id);
        }
        Ok(existed)
    }

    async fn entries(&self, run_id: Uuid) -> Result<Map<String, Value>> {
        Ok(self.data.read().get(&run_id).cloned().unwrap_or_default())
    }

    async fn purge(&self, run_id: Uuid) -> Result<usize> {
        Ok(self.data.write().remove(&run_id).map(|run| run.len()).unwrap_or(0))
    }

    async fn runs(&self) -> Result<Vec<Uuid>> {
        Ok(self.data.read().keys().copied().collect())
    }
}

//! Embedding/vector store collaborator contract.
//!
//! The core depends only on success or failure of `upsert`; the layout of
//! the vector store is the collaborator's business.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Errors from the vector store.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    /// The store could not be reached.
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected the payload.
    #[error("vector store rejected payload: {0}")]
    Rejected(String),
}

/// A stored user vector with its payload.
#[derive(Debug, Clone)]
pub struct StoredVector {
    /// The embedding.
    pub vector: Vec<f32>,
    /// Attached payload.
    pub payload: serde_json::Value,
}

/// Embedding store collaborator.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the user's vector.
    async fn upsert(
        &self,
        user_id: i64,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), VectorError>;

    /// Fetch the user's vector.
    async fn get(&self, user_id: i64) -> Result<Option<StoredVector>, VectorError>;
}

/// In-process vector store for tests and local runs.
#[derive(Default)]
pub struct MemoryVectorStore {
    vectors: Mutex<HashMap<i64, StoredVector>>,
}

impl MemoryVectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(
        &self,
        user_id: i64,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), VectorError> {
        self.vectors
            .lock()
            .insert(user_id, StoredVector { vector, payload });
        Ok(())
    }

    async fn get(&self, user_id: i64) -> Result<Option<StoredVector>, VectorError> {
        Ok(self.vectors.lock().get(&user_id).cloned())
    }
}

//! Embedding index: per-fragment and per-claim vectors with cosine search.
//!
//! Vectors live in the same database as the entities they describe, so a
//! (target, vector) pair is updated atomically. Search is a linear scan;
//! corpora here are bounded by task budgets, so recall is exact.

use chrono::Utc;
use rusqlite::params;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::rpc::EmbedClient;
use crate::store::types::NodeKind;
use crate::store::EvidenceStore;

/// Cosine similarity between two vectors. Zero-magnitude inputs score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub(crate) fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Vector index over store entities for a fixed embedding model.
pub struct EmbeddingIndex {
    store: Arc<EvidenceStore>,
    model_id: String,
}

impl EmbeddingIndex {
    pub fn new(store: Arc<EvidenceStore>, model_id: impl Into<String>) -> Self {
        Self {
            store,
            model_id: model_id.into(),
        }
    }

    /// The model whose vectors this index stores.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Store a vector for a target. Last writer wins per (target, model).
    pub fn store_vector(&self, kind: NodeKind, target_id: &str, vector: &[f32]) -> Result<()> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (target_kind, target_id, model_id, vector, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                kind.to_string(),
                target_id,
                self.model_id,
                encode_vector(vector),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    /// Load a stored vector.
    pub fn get_vector(&self, kind: NodeKind, target_id: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings
                 WHERE target_kind = ?1 AND target_id = ?2 AND model_id = ?3",
                params![kind.to_string(), target_id, self.model_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(blob.map(|b| decode_vector(&b)))
    }

    /// Embed `text` and store the vector, skipping the remote call when a
    /// vector already exists for (target, model).
    pub async fn embed_and_store(
        &self,
        client: &dyn EmbedClient,
        kind: NodeKind,
        target_id: &str,
        text: &str,
    ) -> Result<()> {
        if self.get_vector(kind, target_id)?.is_some() {
            return Ok(());
        }
        let mut vectors = client.embed(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| Error::rpc("embed", "endpoint returned no vectors"))?;
        self.store_vector(kind, target_id, &vector)
    }

    /// The `k` stored vectors of the given kind closest to `query` by
    /// cosine, best first. Ties break on target id so ordering is total.
    pub fn nearest(&self, kind: NodeKind, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let conn = self.store.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;
        let mut stmt = conn
            .prepare(
                "SELECT target_id, vector FROM embeddings
                 WHERE target_kind = ?1 AND model_id = ?2",
            )
            .map_err(|e| Error::store(e.to_string()))?;
        let mut scored: Vec<(String, f32)> = stmt
            .query_map(params![kind.to_string(), self.model_id], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })
            .map_err(|e| Error::store(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(|(id, blob)| {
                let score = cosine(query, &decode_vector(&blob));
                (id, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockEmbedClient;

    fn index() -> EmbeddingIndex {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        EmbeddingIndex::new(store, "test-model")
    }

    #[test]
    fn test_cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_vector_round_trip() {
        let idx = index();
        let v = vec![0.25f32, -1.5, 3.0];
        idx.store_vector(NodeKind::Fragment, "f1", &v).unwrap();
        let loaded = idx.get_vector(NodeKind::Fragment, "f1").unwrap().unwrap();
        assert_eq!(loaded, v);

        // Different kind, same id: separate key.
        assert!(idx.get_vector(NodeKind::Claim, "f1").unwrap().is_none());
    }

    #[test]
    fn test_store_vector_last_writer_wins() {
        let idx = index();
        idx.store_vector(NodeKind::Claim, "c1", &[1.0, 0.0]).unwrap();
        idx.store_vector(NodeKind::Claim, "c1", &[0.0, 1.0]).unwrap();
        let loaded = idx.get_vector(NodeKind::Claim, "c1").unwrap().unwrap();
        assert_eq!(loaded, vec![0.0, 1.0]);
    }

    #[test]
    fn test_nearest_orders_by_cosine() {
        let idx = index();
        idx.store_vector(NodeKind::Fragment, "aligned", &[1.0, 0.0]).unwrap();
        idx.store_vector(NodeKind::Fragment, "diagonal", &[1.0, 1.0]).unwrap();
        idx.store_vector(NodeKind::Fragment, "orthogonal", &[0.0, 1.0]).unwrap();

        let hits = idx.nearest(NodeKind::Fragment, &[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "aligned");
        assert_eq!(hits[1].0, "diagonal");
    }

    #[tokio::test]
    async fn test_embed_and_store_is_idempotent() {
        let idx = index();
        let client = MockEmbedClient::returning(vec![1.0, 2.0]);

        idx.embed_and_store(&client, NodeKind::Claim, "c1", "text")
            .await
            .unwrap();
        idx.embed_and_store(&client, NodeKind::Claim, "c1", "text")
            .await
            .unwrap();

        // Second call short-circuits before the endpoint.
        assert_eq!(client.calls(), 1);
        assert_eq!(
            idx.get_vector(NodeKind::Claim, "c1").unwrap().unwrap(),
            vec![1.0, 2.0]
        );
    }
}

//! Vector index backends behind one interface.
//!
//! The on-disk format is one JSON file per index holding chunk text,
//! metadata, and embeddings. Search runs over an in-memory view: the flat
//! backend scans inner products; with the `hnsw` feature an
//! approximate-graph index is rebuilt from the stored vectors on load and
//! preferred for lookups. Scores are inner products, descending.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::rag::RagError;

/// One stored chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    pub text: String,
    pub metadata: Value,
    pub embedding: Vec<f32>,
}

/// One search result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

/// File-backed index: load, append, search, save.
#[derive(Default, Serialize, Deserialize)]
pub struct VectorIndex {
    pub dimension: usize,
    pub entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, RagError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| RagError::Io(format!("read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), RagError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RagError::Io(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        let data = serde_json::to_string(self)?;
        std::fs::write(path, data)
            .map_err(|e| RagError::Io(format!("write {}: {}", path.display(), e)))
    }

    pub fn add(&mut self, text: String, metadata: Value, embedding: Vec<f32>) {
        if self.dimension == 0 {
            self.dimension = embedding.len();
        }
        self.entries.push(IndexEntry {
            text,
            metadata,
            embedding,
        });
    }

    /// Top-k entries by inner product with `query`, descending.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        #[cfg(feature = "hnsw")]
        {
            if self.entries.len() > HNSW_MIN_ENTRIES {
                return self.search_hnsw(query, top_k);
            }
        }
        self.search_flat(query, top_k)
    }

    /// Exhaustive inner-product scan.
    pub fn search_flat(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .filter(|e| e.embedding.len() == query.len())
            .map(|e| {
                let score: f32 = e.embedding.iter().zip(query).map(|(a, b)| a * b).sum();
                (score, e)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(top_k)
            .map(|(score, e)| SearchHit {
                text: e.text.clone(),
                score,
                metadata: e.metadata.clone(),
            })
            .collect()
    }

    #[cfg(feature = "hnsw")]
    fn search_hnsw(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        use hnsw_rs::prelude::*;

        let hnsw: Hnsw<f32, DistDot> = Hnsw::new(16, self.entries.len().max(16), 16, 200, DistDot {});
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.embedding.len() == query.len() {
                hnsw.insert((&entry.embedding, i));
            }
        }
        let ef_search = (top_k * 4).max(24);
        hnsw.search(query, top_k, ef_search)
            .into_iter()
            .filter_map(|n| {
                self.entries.get(n.d_id).map(|e| SearchHit {
                    text: e.text.clone(),
                    // DistDot is 1 - dot; invert back to an inner product.
                    score: 1.0 - n.distance,
                    metadata: e.metadata.clone(),
                })
            })
            .collect()
    }
}

/// Below this size the graph backend is not worth building.
#[cfg(feature = "hnsw")]
const HNSW_MIN_ENTRIES: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(dims: &[(usize, f32)], len: usize) -> Vec<f32> {
        let mut v = vec![0f32; len];
        for (i, x) in dims {
            v[*i] = *x;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    /// **Scenario**: flat search orders by inner product, descending.
    #[test]
    fn flat_search_orders_by_score() {
        let mut idx = VectorIndex::new(4);
        idx.add("close".into(), json!({"i": 0}), unit(&[(0, 1.0)], 4));
        idx.add("far".into(), json!({"i": 1}), unit(&[(1, 1.0)], 4));
        idx.add("mid".into(), json!({"i": 2}), unit(&[(0, 1.0), (1, 1.0)], 4));

        let hits = idx.search_flat(&unit(&[(0, 1.0)], 4), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "close");
        assert_eq!(hits[1].text, "mid");
        assert!(hits[0].score > hits[1].score);
    }

    /// **Scenario**: the index round-trips through its file format.
    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb_1.json");
        let mut idx = VectorIndex::new(3);
        idx.add("chunk".into(), json!({"chunk_index": 0}), vec![1.0, 0.0, 0.0]);
        idx.save(&path).unwrap();

        let back = VectorIndex::load(&path).unwrap();
        assert_eq!(back.dimension, 3);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].metadata["chunk_index"], 0);
    }

    /// **Scenario**: entries with a mismatched dimension are skipped, not
    /// scored garbage.
    #[test]
    fn dimension_mismatch_skipped() {
        let mut idx = VectorIndex::new(3);
        idx.add("good".into(), json!({}), vec![1.0, 0.0, 0.0]);
        idx.add("bad".into(), json!({}), vec![1.0]);
        let hits = idx.search_flat(&[1.0, 0.0, 0.0], 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "good");
    }

    /// **Scenario**: top_k larger than the index returns everything.
    #[test]
    fn top_k_caps_at_len() {
        let mut idx = VectorIndex::new(2);
        idx.add("only".into(), json!({}), vec![1.0, 0.0]);
        assert_eq!(idx.search(&[1.0, 0.0], 5).len(), 1);
    }
}

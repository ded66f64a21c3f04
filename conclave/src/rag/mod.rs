//! Retrieval-augmented generation: per-session and per-KB chunked vector
//! indexes persisted under the indexes root.
//!
//! Index files are keyed `session_<id>` / `kb_<id>`. Documents are chunked
//! (window 500 chars, overlap 50), embedded, and appended; `search` embeds
//! the query and returns top-k hits by score descending. Search failures log
//! and return empty — retrieval never breaks a chat turn.

pub mod chunk;
pub mod embed;
pub mod extract;
pub mod index;

pub use chunk::{chunk_text, CHUNK_OVERLAP, CHUNK_SIZE};
pub use embed::{Embedder, HashEmbedder, OpenAiEmbedder};
pub use extract::extract_text;
pub use index::{SearchHit, VectorIndex};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

/// Errors from indexing and retrieval.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("io: {0}")]
    Io(String),
    #[error("embedding: {0}")]
    Embedding(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Which index a call targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexKey {
    Session(String),
    Kb(String),
}

impl IndexKey {
    fn file_stem(&self) -> String {
        match self {
            IndexKey::Session(id) => format!("session_{}", id),
            IndexKey::Kb(id) => format!("kb_{}", id),
        }
    }
}

/// File-backed RAG service.
pub struct RagService {
    indexes_root: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl RagService {
    pub fn new(indexes_root: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            indexes_root: indexes_root.into(),
            embedder,
        }
    }

    fn index_path(&self, key: &IndexKey) -> PathBuf {
        self.indexes_root.join(format!("{}.json", key.file_stem()))
    }

    pub fn has_index(&self, key: &IndexKey) -> bool {
        self.index_path(key).exists()
    }

    /// Chunks, embeds, and appends one document. Returns the number of chunks
    /// added.
    pub async fn index_document(
        &self,
        key: &IndexKey,
        text: &str,
        metadata: Value,
    ) -> Result<usize, RagError> {
        let chunks = chunk_text(text, CHUNK_SIZE, CHUNK_OVERLAP);
        if chunks.is_empty() {
            return Ok(0);
        }
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let embeddings = self.embedder.embed(&refs).await?;

        let path = self.index_path(key);
        let mut index = if path.exists() {
            load_index(&path)?
        } else {
            VectorIndex::new(self.embedder.dimension())
        };
        let added = chunks.len();
        for (i, (chunk, embedding)) in chunks.into_iter().zip(embeddings).enumerate() {
            let mut chunk_meta = metadata.clone();
            if let Some(obj) = chunk_meta.as_object_mut() {
                obj.insert("chunk_index".into(), json!(i));
            }
            index.add(chunk, chunk_meta, embedding);
        }
        save_index(&path, &index)?;
        Ok(added)
    }

    /// Top-k hits for `query`; missing index or any failure yields empty.
    pub async fn search(&self, key: &IndexKey, query: &str, top_k: usize) -> Vec<SearchHit> {
        let path = self.index_path(key);
        if !path.exists() {
            return Vec::new();
        }
        let index = match load_index(&path) {
            Ok(index) => index,
            Err(e) => {
                warn!(index = %path.display(), error = %e, "failed to load index");
                return Vec::new();
            }
        };
        let query_vec = match self.embedder.embed(&[query]).await {
            Ok(mut vecs) if !vecs.is_empty() => vecs.remove(0),
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return Vec::new();
            }
        };
        index.search(&query_vec, top_k)
    }

    /// Removes an index file if present.
    pub fn delete_index(&self, key: &IndexKey) {
        let path = self.index_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(index = %path.display(), error = %e, "failed to delete index");
            }
        }
    }
}

fn load_index(path: &Path) -> Result<VectorIndex, RagError> {
    VectorIndex::load(path)
}

fn save_index(path: &Path, index: &VectorIndex) -> Result<(), RagError> {
    index.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &tempfile::TempDir) -> RagService {
        RagService::new(dir.path(), Arc::new(HashEmbedder::default()))
    }

    /// **Scenario**: indexing then searching returns relevant chunks with
    /// metadata carrying chunk_index.
    #[tokio::test]
    async fn index_and_search_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let rag = service(&dir);
        let key = IndexKey::Session("s1".into());

        assert!(!rag.has_index(&key));
        let added = rag
            .index_document(
                &key,
                "The borrow checker enforces ownership rules in Rust programs.",
                json!({"filename": "notes.md"}),
            )
            .await
            .unwrap();
        assert!(added >= 1);
        assert!(rag.has_index(&key));

        let hits = rag.search(&key, "rust ownership borrow", 3).await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].metadata["filename"], "notes.md");
        assert_eq!(hits[0].metadata["chunk_index"], 0);
    }

    /// **Scenario**: searching a missing index is empty, not an error.
    #[tokio::test]
    async fn missing_index_search_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rag = service(&dir);
        let hits = rag.search(&IndexKey::Kb("nope".into()), "anything", 5).await;
        assert!(hits.is_empty());
    }

    /// **Scenario**: session and KB keys map to distinct files.
    #[tokio::test]
    async fn key_namespaces_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let rag = service(&dir);
        rag.index_document(&IndexKey::Session("7".into()), "session text", json!({}))
            .await
            .unwrap();
        assert!(rag.has_index(&IndexKey::Session("7".into())));
        assert!(!rag.has_index(&IndexKey::Kb("7".into())));
        assert!(dir.path().join("session_7.json").exists());
    }

    /// **Scenario**: delete_index removes the file.
    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let rag = service(&dir);
        let key = IndexKey::Kb("k1".into());
        rag.index_document(&key, "content", json!({})).await.unwrap();
        assert!(rag.has_index(&key));
        rag.delete_index(&key);
        assert!(!rag.has_index(&key));
    }

    /// **Scenario**: indexing whitespace adds nothing and creates no file.
    #[tokio::test]
    async fn empty_document_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let rag = service(&dir);
        let key = IndexKey::Session("empty".into());
        assert_eq!(rag.index_document(&key, "   ", json!({})).await.unwrap(), 0);
        assert!(!rag.has_index(&key));
    }
}

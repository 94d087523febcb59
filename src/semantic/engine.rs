//! Retrieval engine: cache-aware index building and query answering.
//!
//! The engine moves through three states:
//! - `Uninitialized`: no documents have been loaded
//! - `Loaded`: documents are present but the index is missing or stale
//! - `Indexed`: the published index was built from the current documents
//!
//! Rebuilds never mutate a published index. A new [`IndexState`] is built
//! off to the side and swapped in under a short write lock, so concurrent
//! searches keep using the snapshot they started with.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::documents::{self, DocumentError, DocumentRecord};
use crate::semantic::cache::{CacheError, CacheUpdate, EmbeddingCache};
use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::semantic::index::{self, BackendKind, IndexError, IndexState};
use crate::semantic::lexical::{self, MatchInfo};
use crate::semantic::preprocess::{content_hash, preview};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Query cannot be empty")]
    EmptyQuery,

    #[error("top_k must be at least 1, got {0}")]
    InvalidTopK(i64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No documents loaded")]
    NotLoaded,

    #[error("Index not built for the current documents")]
    NotIndexed,

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Document error: {0}")]
    Documents(#[from] DocumentError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SearchError {
    /// Bad request from the caller; nothing was touched.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SearchError::EmptyQuery | SearchError::InvalidTopK(_) | SearchError::InvalidRequest(_)
        )
    }

    /// The engine has nothing to search yet.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SearchError::NotLoaded | SearchError::NotIndexed)
    }
}

/// Lifecycle state of a [`SearchEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Loaded,
    Indexed,
}

/// One ranked hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    pub preview: String,
    pub match_info: MatchInfo,
}

/// Summary of a `build_index` run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub documents: usize,
    pub cache_hits: usize,
    pub computed: usize,
    pub backend: BackendKind,
    /// Requested backend was unavailable and brute force was used instead
    pub fallback: bool,
}

/// Point-in-time view of the engine for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub documents: usize,
    pub indexed: usize,
    pub backend: Option<BackendKind>,
    pub fallback: bool,
    pub dimensions: usize,
}

/// Documents in load order. `order[i]` becomes row `i` of the index.
#[derive(Default)]
struct DocumentSet {
    order: Vec<String>,
    records: HashMap<String, DocumentRecord>,
    generation: u64,
    loaded: bool,
}

/// An index paired with the exact document set it was built from.
#[derive(Clone)]
struct Snapshot {
    documents: Arc<DocumentSet>,
    index: Arc<IndexState>,
}

/// Semantic search engine over an in-memory document set.
pub struct SearchEngine {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    backend: BackendKind,
    documents: RwLock<Arc<DocumentSet>>,
    published: RwLock<Option<Snapshot>>,
    /// Serializes index builds
    build_lock: Mutex<()>,
}

impl SearchEngine {
    /// Create an engine with no documents.
    ///
    /// # Arguments
    /// * `provider` - Embedding provider used for documents and queries
    /// * `cache` - Durable embedding cache
    /// * `backend` - Preferred nearest-neighbor backend
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: EmbeddingCache,
        backend: BackendKind,
    ) -> Self {
        Self {
            provider,
            cache,
            backend,
            documents: RwLock::new(Arc::new(DocumentSet::default())),
            published: RwLock::new(None),
            build_lock: Mutex::new(()),
        }
    }

    /// Load all `.txt` documents from `folder`, replacing the current set.
    /// Returns the number of documents loaded.
    pub fn load_documents(&self, folder: &Path) -> Result<usize, SearchError> {
        let records = documents::load_documents(folder)?;
        self.set_documents(records)
    }

    /// Replace the current document set. Any published index becomes stale
    /// until the next `build_index`.
    pub fn set_documents(&self, records: Vec<DocumentRecord>) -> Result<usize, SearchError> {
        let mut order = Vec::with_capacity(records.len());
        let mut by_id = HashMap::with_capacity(records.len());
        for record in records {
            if by_id.contains_key(&record.doc_id) {
                return Err(DocumentError::DuplicateId(record.doc_id).into());
            }
            order.push(record.doc_id.clone());
            by_id.insert(record.doc_id.clone(), record);
        }

        let mut guard = self
            .documents
            .write()
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))?;

        let count = order.len();
        let generation = guard.generation + 1;
        *guard = Arc::new(DocumentSet {
            order,
            records: by_id,
            generation,
            loaded: true,
        });

        log::info!("Loaded {} documents", count);
        Ok(count)
    }

    /// Embed every loaded document (reusing cached vectors whose content hash
    /// still matches) and publish a fresh index.
    ///
    /// With `force_recompute` every document is re-embedded and its cache
    /// entry overwritten.
    pub fn build_index(&self, force_recompute: bool) -> Result<BuildReport, SearchError> {
        let _build = self
            .build_lock
            .lock()
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))?;

        let docs = self.current_documents()?;
        if !docs.loaded {
            return Err(SearchError::NotLoaded);
        }

        let dimensions = self.provider.dimensions();
        let mut rows: Vec<Option<Vec<f32>>> = Vec::with_capacity(docs.order.len());
        let mut misses: Vec<(usize, String)> = Vec::new();

        for (position, doc_id) in docs.order.iter().enumerate() {
            let record = docs.record(doc_id)?;
            let hash = content_hash(&record.text);

            let cached = if force_recompute {
                None
            } else {
                self.cache.get(doc_id)?.filter(|entry| {
                    entry.content_hash == hash && entry.embedding.len() == dimensions
                })
            };

            match cached {
                Some(entry) => rows.push(Some(entry.embedding)),
                None => {
                    rows.push(None);
                    misses.push((position, hash));
                }
            }
        }

        let cache_hits = docs.order.len() - misses.len();
        log::info!(
            "Building index: {} documents, {} cached, {} to embed",
            docs.order.len(),
            cache_hits,
            misses.len()
        );

        if !misses.is_empty() {
            let texts: Vec<String> = misses
                .iter()
                .map(|(position, _)| docs.record(&docs.order[*position]).map(|r| r.text.clone()))
                .collect::<Result<_, _>>()?;

            let computed = self.provider.embed_batch(&texts)?;
            if computed.len() != misses.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: misses.len(),
                    got: computed.len(),
                }
                .into());
            }

            let updates = misses
                .iter()
                .zip(&computed)
                .map(|((position, hash), embedding)| {
                    let record = docs.record(&docs.order[*position])?;
                    Ok(CacheUpdate {
                        doc_id: &record.doc_id,
                        filename: &record.metadata.filename,
                        content_hash: hash,
                        embedding,
                    })
                })
                .collect::<Result<Vec<_>, SearchError>>()?;
            self.cache.upsert_many(&updates)?;

            for ((position, _), embedding) in misses.iter().zip(computed) {
                rows[*position] = Some(embedding);
            }
        }

        let rows: Vec<Vec<f32>> = rows
            .into_iter()
            .map(|row| row.ok_or_else(|| SearchError::Internal("missing embedding row".to_string())))
            .collect::<Result<_, _>>()?;

        let nn = index::build_backend(self.backend, rows, dimensions)?;
        let state = IndexState::new(docs.order.clone(), nn, self.backend, docs.generation)?;

        if state.is_fallback() {
            log::warn!(
                "{} backend unavailable, using {} search",
                self.backend,
                state.backend()
            );
        }

        let report = BuildReport {
            documents: state.len(),
            cache_hits,
            computed: misses.len(),
            backend: state.backend(),
            fallback: state.is_fallback(),
        };

        let mut published = self
            .published
            .write()
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))?;
        *published = Some(Snapshot {
            documents: docs,
            index: Arc::new(state),
        });

        log::info!("Index ready: {} documents ({})", report.documents, report.backend);
        Ok(report)
    }

    /// Return up to `top_k` documents most similar to `query`, highest first,
    /// each with lexical overlap diagnostics.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if top_k < 1 {
            return Err(SearchError::InvalidTopK(top_k as i64));
        }

        let snapshot = self.current_snapshot()?;

        let mut query_embedding = self.provider.embed_one(query)?;
        index::normalize(&mut query_embedding);

        let hits = snapshot.index.search(&query_embedding, top_k)?;
        let query_tokens: BTreeSet<String> = lexical::token_set(query);

        hits.into_iter()
            .map(|(doc_id, score)| {
                let record = snapshot.documents.record(doc_id)?;
                Ok(SearchResult {
                    doc_id: doc_id.to_string(),
                    score,
                    preview: preview(&record.text),
                    match_info: lexical::match_info(&query_tokens, &record.text),
                })
            })
            .collect()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        let Ok(docs) = self.current_documents() else {
            return EngineState::Uninitialized;
        };
        if !docs.loaded {
            return EngineState::Uninitialized;
        }

        let indexed = self
            .published
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.index.generation() == docs.generation))
            .unwrap_or(false);

        if indexed {
            EngineState::Indexed
        } else {
            EngineState::Loaded
        }
    }

    /// Whether `search` can be served.
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Indexed
    }

    /// The most recently published index, even if it is stale.
    pub fn index(&self) -> Option<Arc<IndexState>> {
        self.published
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.index.clone()))
    }

    /// Snapshot of documents, index size and backend.
    pub fn status(&self) -> EngineStatus {
        let documents = self.document_count();
        let index = self.index();

        EngineStatus {
            state: self.state(),
            documents,
            indexed: index.as_ref().map(|i| i.len()).unwrap_or(0),
            backend: index.as_ref().map(|i| i.backend()),
            fallback: index.as_ref().map(|i| i.is_fallback()).unwrap_or(false),
            dimensions: self.provider.dimensions(),
        }
    }

    /// Number of loaded documents.
    pub fn document_count(&self) -> usize {
        self.current_documents()
            .map(|docs| docs.order.len())
            .unwrap_or(0)
    }

    /// Ids of the loaded documents, in index order.
    pub fn doc_ids(&self) -> Vec<String> {
        self.current_documents()
            .map(|docs| docs.order.clone())
            .unwrap_or_default()
    }

    /// Backend requested at construction.
    pub fn requested_backend(&self) -> BackendKind {
        self.backend
    }

    /// The underlying embedding cache.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Drop cache entries for documents that are no longer loaded.
    pub fn prune_cache(&self) -> Result<usize, SearchError> {
        let docs = self.current_documents()?;
        if !docs.loaded {
            return Err(SearchError::NotLoaded);
        }
        Ok(self.cache.prune(&docs.order)?)
    }

    /// Release the embedding cache.
    pub fn close(&self) -> Result<(), SearchError> {
        self.cache.close()?;
        Ok(())
    }

    fn current_documents(&self) -> Result<Arc<DocumentSet>, SearchError> {
        self.documents
            .read()
            .map(|guard| guard.clone())
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn current_snapshot(&self) -> Result<Snapshot, SearchError> {
        let docs = self.current_documents()?;
        if !docs.loaded {
            return Err(SearchError::NotLoaded);
        }

        let guard = self
            .published
            .read()
            .map_err(|e| SearchError::Internal(format!("Lock poisoned: {}", e)))?;

        match guard.as_ref() {
            Some(snapshot) if snapshot.index.generation() == docs.generation => {
                Ok(snapshot.clone())
            }
            _ => Err(SearchError::NotIndexed),
        }
    }
}

impl DocumentSet {
    fn record(&self, doc_id: &str) -> Result<&DocumentRecord, SearchError> {
        self.records
            .get(doc_id)
            .ok_or_else(|| SearchError::Internal(format!("document '{doc_id}' missing from set")))
    }
}

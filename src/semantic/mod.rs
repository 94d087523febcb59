//! Semantic document retrieval.
//!
//! This module embeds documents with fastembed-rs, caches the vectors on disk
//! keyed by content hash, and answers queries by cosine similarity.
//!
//! # Architecture
//!
//! - `cache`: Durable embedding cache (embeddings.bin)
//! - `embeddings`: Embedding provider trait and the fastembed model
//! - `index`: Normalized nearest-neighbor backends
//! - `engine`: Cache-aware index builder and query engine
//! - `lexical`: Query/document token overlap diagnostics
//! - `preprocess`: Content hashing and previews

pub mod cache;
pub mod embeddings;
mod engine;
pub mod index;
pub mod lexical;
mod preprocess;

pub use cache::{CacheEntry, CacheError, CacheUpdate, EmbeddingCache};
pub use embeddings::{EmbeddingError, EmbeddingModel, EmbeddingProvider};
pub use engine::{BuildReport, EngineState, EngineStatus, SearchEngine, SearchError, SearchResult};
pub use index::{BackendKind, IndexError, IndexState};
pub use lexical::MatchInfo;
pub use preprocess::{content_hash, preview};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Default number of results per query
pub const DEFAULT_TOP_K: usize = 5;

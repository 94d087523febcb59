use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::documents::DocumentRecord;
use crate::semantic::embeddings::embed_non_blank;
use crate::semantic::lexical;
use crate::semantic::{BackendKind, EmbeddingCache, EmbeddingError, EmbeddingProvider, SearchEngine};

/// Words sharing a concept land on the same dimension.
const CONCEPTS: &[&[&str]] = &[
    &["cat", "cats", "kitten", "kittens", "feline"],
    &["dog", "dogs", "puppy", "puppies"],
    &["pet", "pets"],
    &["bark", "barks", "barking"],
    &["night", "nights", "evening"],
    &["loud", "loudly", "noisy"],
    &["mat", "mats", "rug"],
    &["sat", "sit", "sits"],
    &["car", "cars", "vehicle"],
    &["engine", "engines", "motor"],
    &["rust", "rusty", "corrosion"],
    &["garden", "gardens", "flowers"],
];

/// Unknown words are hashed into this many extra dimensions.
const HASH_BUCKETS: usize = 16;

/// Deterministic bag-of-concepts embedder that records every call.
pub struct WordProvider {
    padding: usize,
    fail: AtomicBool,
    batches: Mutex<Vec<Vec<String>>>,
    queries: AtomicUsize,
}

impl WordProvider {
    pub fn new() -> Self {
        Self::with_padding(0)
    }

    /// Same vectors with `padding` trailing zero dimensions.
    pub fn with_padding(padding: usize) -> Self {
        Self {
            padding,
            fail: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Texts passed to each `embed_batch` call, in call order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Total texts embedded through `embed_batch`.
    pub fn embedded_texts(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }

    pub fn query_calls(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0; self.dimensions()];
        for token in lexical::tokenize(text) {
            let slot = CONCEPTS
                .iter()
                .position(|words| words.contains(&token.as_str()))
                .unwrap_or_else(|| {
                    let mut hasher = DefaultHasher::new();
                    token.hash(&mut hasher);
                    CONCEPTS.len() + (hasher.finish() as usize % HASH_BUCKETS)
                });
            v[slot] += 1.0;
        }
        v
    }

    fn check_failure(&self) -> Result<(), EmbeddingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::EmbeddingFailed(
                "provider unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl EmbeddingProvider for WordProvider {
    fn name(&self) -> &str {
        "word-provider"
    }

    fn dimensions(&self) -> usize {
        CONCEPTS.len() + HASH_BUCKETS + self.padding
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(self.vectorize(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.check_failure()?;
        self.batches.lock().unwrap().push(texts.to_vec());
        embed_non_blank(texts, self.dimensions(), |batch| {
            Ok(batch.iter().map(|t| self.vectorize(t)).collect())
        })
    }
}

/// Returns a preset vector per exact text, for hand-picked geometry.
pub struct TableProvider {
    dimensions: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl TableProvider {
    pub fn new(dimensions: usize, vectors: Vec<(&str, Vec<f32>)>) -> Self {
        Self {
            dimensions,
            vectors: vectors
                .into_iter()
                .map(|(text, v)| (text.to_string(), v))
                .collect(),
        }
    }

    fn lookup(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed(format!("no vector for '{text}'")))
    }
}

impl EmbeddingProvider for TableProvider {
    fn name(&self) -> &str {
        "table-provider"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }
        self.lookup(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        embed_non_blank(texts, self.dimensions, |batch| {
            batch.iter().map(|t| self.lookup(t)).collect()
        })
    }
}

pub struct Fixture {
    pub engine: Arc<SearchEngine>,
    pub provider: Arc<WordProvider>,
    pub dir: TempDir,
}

impl Fixture {
    pub fn cache_path(&self) -> std::path::PathBuf {
        self.dir.path().join("embeddings.bin")
    }

    /// A second engine over the same cache file, as after a restart.
    pub fn restart(&self, provider: Arc<WordProvider>, backend: BackendKind) -> SearchEngine {
        self.engine.close().unwrap();
        let cache = EmbeddingCache::open(self.cache_path()).unwrap();
        SearchEngine::new(provider, cache, backend)
    }
}

pub fn fixture(backend: BackendKind) -> Fixture {
    fixture_with(Arc::new(WordProvider::new()), backend)
}

pub fn fixture_with(provider: Arc<WordProvider>, backend: BackendKind) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cache = EmbeddingCache::open(dir.path().join("embeddings.bin")).unwrap();
    let engine = SearchEngine::new(provider.clone(), cache, backend);
    Fixture {
        engine: Arc::new(engine),
        provider,
        dir,
    }
}

pub fn doc(id: &str, text: &str) -> DocumentRecord {
    DocumentRecord::new(id, &format!("{id}.txt"), text)
}

/// The three-document corpus used across scenarios.
pub fn pets_corpus() -> Vec<DocumentRecord> {
    vec![
        doc("doc1", "The cat sat on the mat"),
        doc("doc2", "Dogs bark loudly at night"),
        doc("doc3", "Cats and dogs are pets"),
    ]
}

pub fn write_docs(folder: &Path, docs: &[(&str, &str)]) {
    std::fs::create_dir_all(folder).unwrap();
    for (name, text) in docs {
        std::fs::write(folder.join(name), text).unwrap();
    }
}

//! Embedding providers.
//!
//! The engine only depends on the [`EmbeddingProvider`] contract: text in,
//! fixed-dimension `f32` vectors out, blank text mapped to a zero vector.
//! [`EmbeddingModel`] is the production implementation backed by fastembed:
//! - Model download on first use into a configurable cache directory
//! - Dimension probing at load time
//! - Batch embedding generation

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

/// Converts text into dense vectors of a fixed dimensionality.
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier of the underlying model.
    fn name(&self) -> &str;

    /// Dimensionality `D` of every returned vector.
    fn dimensions(&self) -> usize;

    /// Embed one text. Blank input yields a zero vector of length `D`.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed many texts in one call, preserving input order.
    /// Blank entries yield zero vectors of length `D`.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    ///
    /// # Arguments
    /// * `model_name` - Name of the model (e.g., "all-MiniLM-L6-v2")
    /// * `cache_dir` - Directory to cache downloaded models
    /// * `download_timeout` - Limit on download plus load; defaults to 5 minutes
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!(
            "Loading embedding model '{}' (download timeout {}s)",
            model_name,
            timeout.as_secs()
        );

        let (model, dimensions) = run_with_timeout(timeout, move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);
            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
            let dimensions = Self::probe_dimensions(&mut model)?;
            Ok((model, dimensions))
        })?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }

    fn run(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

impl EmbeddingProvider for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        self.run(vec![text])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        embed_non_blank(texts, self.dimensions, |batch| self.run(batch))
    }
}

/// Run `init` on a helper thread and wait at most `timeout` for it.
///
/// On timeout the helper keeps running detached until `init` returns; its
/// result is dropped.
fn run_with_timeout<T, F>(timeout: Duration, init: F) -> Result<T, EmbeddingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmbeddingError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("embedding-init".to_string())
        .spawn(move || {
            let _ = tx.send(init());
        })
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to spawn model loader: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(EmbeddingError::InitFailed(format!(
            "Model download/load did not finish within {}s",
            timeout.as_secs()
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(EmbeddingError::InitFailed(
            "Model loader exited without a result".to_string(),
        )),
    }
}

/// Run `embed` over the non-blank entries of `texts` and scatter the results
/// back into input order, filling blank positions with zero vectors.
pub fn embed_non_blank<F>(
    texts: &[String],
    dimensions: usize,
    embed: F,
) -> Result<Vec<Vec<f32>>, EmbeddingError>
where
    F: FnOnce(Vec<&str>) -> Result<Vec<Vec<f32>>, EmbeddingError>,
{
    let mut out = vec![vec![0.0; dimensions]; texts.len()];

    let (positions, batch): (Vec<usize>, Vec<&str>) = texts
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.trim().is_empty())
        .map(|(i, t)| (i, t.as_str()))
        .unzip();

    if batch.is_empty() {
        return Ok(out);
    }

    let computed = embed(batch)?;
    if computed.len() != positions.len() {
        return Err(EmbeddingError::CountMismatch {
            expected: positions.len(),
            got: computed.len(),
        });
    }

    for (pos, vector) in positions.into_iter().zip(computed) {
        out[pos] = vector;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), None)
            .unwrap();

        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384); // MiniLM produces 384-dim embeddings
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_blank_text_yields_zero_vector() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), None)
            .unwrap();

        let embedding = model.embed_one("   ").unwrap();
        assert_eq!(embedding.len(), 384);
        assert!(embedding.iter().all(|x| *x == 0.0));

        let batch = model
            .embed_batch(&["hello".to_string(), "".to_string()])
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].iter().any(|x| *x != 0.0));
        assert!(batch[1].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("nonexistent-model", temp_dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_run_with_timeout_returns_result() {
        let value = run_with_timeout(Duration::from_secs(5), || Ok(42)).unwrap();
        assert_eq!(value, 42);

        let err = run_with_timeout::<(), _>(Duration::from_secs(5), || {
            Err(EmbeddingError::InitFailed("boom".to_string()))
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_run_with_timeout_gives_up() {
        let start = std::time::Instant::now();
        let result = run_with_timeout(Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        });

        assert!(matches!(result, Err(EmbeddingError::InitFailed(msg)) if msg.contains("did not finish")));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_run_with_timeout_reports_panicked_loader() {
        let result = run_with_timeout::<(), _>(Duration::from_secs(5), || panic!("loader died"));
        assert!(matches!(result, Err(EmbeddingError::InitFailed(msg)) if msg.contains("without a result")));
    }

    #[test]
    fn test_embed_non_blank_preserves_order() {
        let texts = vec![
            "one".to_string(),
            "  ".to_string(),
            "three".to_string(),
        ];

        let out = embed_non_blank(&texts, 2, |batch| {
            assert_eq!(batch, vec!["one", "three"]);
            Ok(batch.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        })
        .unwrap();

        assert_eq!(out, vec![vec![3.0, 1.0], vec![0.0, 0.0], vec![5.0, 1.0]]);
    }

    #[test]
    fn test_embed_non_blank_skips_call_when_all_blank() {
        let texts = vec!["".to_string(), "\t".to_string()];
        let out = embed_non_blank(&texts, 3, |_| panic!("must not be called")).unwrap();
        assert_eq!(out, vec![vec![0.0; 3], vec![0.0; 3]]);
    }

    #[test]
    fn test_embed_non_blank_count_mismatch() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let result = embed_non_blank(&texts, 1, |_| Ok(vec![vec![1.0]]));
        assert!(matches!(
            result,
            Err(EmbeddingError::CountMismatch { expected: 2, got: 1 })
        ));
    }
}

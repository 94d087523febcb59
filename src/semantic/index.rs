//! Nearest-neighbor index over L2-normalized document embeddings.
//!
//! Two interchangeable backends implement [`NearestNeighbors`]:
//! - [`BruteForceIndex`]: sequential exact scan, ties broken by document order
//! - `AcceleratedIndex`: exact scan parallelized with rayon (requires the
//!   `accelerated` feature)
//!
//! Both store rows normalized by the same [`normalize`] routine, so the inner
//! product of a normalized query against any row is its cosine similarity.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Denominator used in place of a zero norm.
pub const NORM_EPSILON: f32 = 1e-9;

/// Nearest-neighbor strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Accelerated,
    BruteForce,
}

impl BackendKind {
    /// Whether this backend was compiled into the binary.
    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Accelerated => cfg!(feature = "accelerated"),
            BackendKind::BruteForce => true,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Accelerated => write!(f, "accelerated"),
            BackendKind::BruteForce => write!(f, "brute_force"),
        }
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index has {rows} rows but {ids} document ids")]
    IdCountMismatch { rows: usize, ids: usize },
}

/// A single hit: row position in the index and its similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub score: f32,
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. A zero vector is divided by
/// `NORM_EPSILON` instead, leaving it at zero magnitude.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    let denom = if norm > 0.0 { norm } else { NORM_EPSILON };
    for x in v.iter_mut() {
        *x /= denom;
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Descending by score. Equal scores compare equal.
fn by_score_desc(scores: &[f32]) -> impl Fn(&usize, &usize) -> Ordering + '_ {
    move |a, b| scores[*b].total_cmp(&scores[*a])
}

/// Row-major `N x D` matrix with every row normalized.
#[derive(Debug, Clone)]
struct NormalizedMatrix {
    data: Vec<f32>,
    dimensions: usize,
}

impl NormalizedMatrix {
    fn build(rows: Vec<Vec<f32>>, dimensions: usize) -> Result<Self, IndexError> {
        let mut data = Vec::with_capacity(rows.len() * dimensions);
        for mut row in rows {
            if row.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    got: row.len(),
                });
            }
            normalize(&mut row);
            data.extend_from_slice(&row);
        }
        Ok(Self { data, dimensions })
    }

    fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    fn row(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    fn check_query(&self, query: &[f32]) -> Result<(), IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        Ok(())
    }
}

/// Common capability set of the nearest-neighbor backends.
pub trait NearestNeighbors: Send + Sync {
    /// Backend actually serving queries.
    fn kind(&self) -> BackendKind;

    /// Number of indexed rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimensions(&self) -> usize;

    /// Normalized row at `position`.
    fn row(&self, position: usize) -> Option<&[f32]>;

    /// Top `k` rows by inner product with an already normalized `query`,
    /// highest first. Returns fewer than `k` when the index is smaller.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError>;
}

/// Exact sequential scan over the normalized matrix.
///
/// Ranking is deterministic: a stable sort keeps tied rows in document order.
#[derive(Debug, Clone)]
pub struct BruteForceIndex {
    matrix: NormalizedMatrix,
}

impl BruteForceIndex {
    /// Normalize `rows` and store them.
    pub fn build(rows: Vec<Vec<f32>>, dimensions: usize) -> Result<Self, IndexError> {
        Ok(Self {
            matrix: NormalizedMatrix::build(rows, dimensions)?,
        })
    }
}

impl NearestNeighbors for BruteForceIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::BruteForce
    }

    fn len(&self) -> usize {
        self.matrix.len()
    }

    fn dimensions(&self) -> usize {
        self.matrix.dimensions
    }

    fn row(&self, position: usize) -> Option<&[f32]> {
        self.matrix.row(position)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.matrix.check_query(query)?;

        let scores: Vec<f32> = (0..self.len())
            .filter_map(|i| self.matrix.row(i))
            .map(|row| dot(row, query))
            .collect();

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(by_score_desc(&scores));
        order.truncate(k);

        Ok(order
            .into_iter()
            .map(|position| Neighbor {
                position,
                score: scores[position],
            })
            .collect())
    }
}

/// Exact inner-product index scanned in parallel.
///
/// Scores are computed on the rayon pool and the top `k` are picked with a
/// partial selection before sorting. Which of several rows tied at the `k`
/// boundary survives the selection is unspecified; the survivors are then
/// ordered by score, ties by ascending row position.
#[cfg(feature = "accelerated")]
#[derive(Debug, Clone)]
pub struct AcceleratedIndex {
    matrix: NormalizedMatrix,
}

#[cfg(feature = "accelerated")]
impl AcceleratedIndex {
    /// Normalize `rows` and store them.
    pub fn build(rows: Vec<Vec<f32>>, dimensions: usize) -> Result<Self, IndexError> {
        Ok(Self {
            matrix: NormalizedMatrix::build(rows, dimensions)?,
        })
    }
}

#[cfg(feature = "accelerated")]
impl NearestNeighbors for AcceleratedIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerated
    }

    fn len(&self) -> usize {
        self.matrix.len()
    }

    fn dimensions(&self) -> usize {
        self.matrix.dimensions
    }

    fn row(&self, position: usize) -> Option<&[f32]> {
        self.matrix.row(position)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        use rayon::prelude::*;

        self.matrix.check_query(query)?;
        let n = self.len();
        let k = k.min(n);
        if k == 0 {
            return Ok(vec![]);
        }

        let scores: Vec<f32> = self
            .matrix
            .data
            .par_chunks(self.matrix.dimensions)
            .map(|row| dot(row, query))
            .collect();

        let mut order: Vec<usize> = (0..n).collect();
        if k < n {
            order.select_nth_unstable_by(k - 1, by_score_desc(&scores));
            order.truncate(k);
        }
        order.sort_by(|a, b| by_score_desc(&scores)(a, b).then(a.cmp(b)));

        Ok(order
            .into_iter()
            .map(|position| Neighbor {
                position,
                score: scores[position],
            })
            .collect())
    }
}

/// Build the requested backend, falling back to brute force when it is not
/// available in this build. The returned index reports the kind in use.
pub fn build_backend(
    requested: BackendKind,
    rows: Vec<Vec<f32>>,
    dimensions: usize,
) -> Result<Box<dyn NearestNeighbors>, IndexError> {
    match requested {
        #[cfg(feature = "accelerated")]
        BackendKind::Accelerated => Ok(Box::new(AcceleratedIndex::build(rows, dimensions)?)),
        _ => Ok(Box::new(BruteForceIndex::build(rows, dimensions)?)),
    }
}

/// One built generation of the index: ids by row position plus the backend.
pub struct IndexState {
    doc_ids: Vec<String>,
    backend: Box<dyn NearestNeighbors>,
    requested: BackendKind,
    generation: u64,
}

impl IndexState {
    /// Assemble a state; `doc_ids[i]` must name row `i` of `backend`.
    pub fn new(
        doc_ids: Vec<String>,
        backend: Box<dyn NearestNeighbors>,
        requested: BackendKind,
        generation: u64,
    ) -> Result<Self, IndexError> {
        if doc_ids.len() != backend.len() {
            return Err(IndexError::IdCountMismatch {
                rows: backend.len(),
                ids: doc_ids.len(),
            });
        }
        Ok(Self {
            doc_ids,
            backend,
            requested,
            generation,
        })
    }

    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.backend.dimensions()
    }

    /// Backend actually serving queries.
    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// True when the requested backend was unavailable and brute force was
    /// substituted.
    pub fn is_fallback(&self) -> bool {
        self.backend.kind() != self.requested
    }

    /// Document generation this index was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Normalized embedding of the document at `position`.
    pub fn embedding(&self, position: usize) -> Option<&[f32]> {
        self.backend.row(position)
    }

    /// Top `k` documents for a normalized query, as `(doc_id, score)`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(&str, f32)>, IndexError> {
        Ok(self
            .backend
            .search(query, k)?
            .into_iter()
            .filter_map(|n| {
                self.doc_ids
                    .get(n.position)
                    .map(|id| (id.as_str(), n.score))
            })
            .collect())
    }
}

//! Lexical overlap diagnostics for search results.
//!
//! Reports which query words also appear in a matched document. The numbers
//! are informational only: they never feed back into scoring or ranking.

use std::collections::{BTreeSet, HashSet};

use once_cell::sync::Lazy;
use serde::Serialize;

/// Maximum number of matched tokens surfaced per result
pub const MAX_MATCHED_TOKENS: usize = 10;

/// English stop words dropped before computing overlap.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "your", "yours",
        "yourself", "yourselves", "he", "him", "his", "himself", "she", "her", "hers",
        "herself", "it", "its", "itself", "they", "them", "their", "theirs", "themselves",
        "what", "which", "who", "whom", "this", "that", "these", "those", "am", "is", "are",
        "was", "were", "be", "been", "being", "have", "has", "had", "having", "do", "does",
        "did", "doing", "a", "an", "the", "and", "but", "if", "or", "because", "as", "until",
        "while", "of", "at", "by", "for", "with", "about", "against", "between", "into",
        "through", "during", "before", "after", "above", "below", "to", "from", "up", "down",
        "in", "out", "on", "off", "over", "under", "again", "further", "then", "once", "here",
        "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
        "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so",
        "than", "too", "very", "s", "t", "can", "will", "just", "don", "should", "now", "d",
        "ll", "m", "o", "re", "ve", "y", "ain", "aren", "couldn", "didn", "doesn", "hadn",
        "hasn", "haven", "isn", "ma", "mightn", "mustn", "needn", "shan", "shouldn", "wasn",
        "weren", "won", "wouldn",
    ]
    .into_iter()
    .collect()
});

/// Overlap between query words and document words.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchInfo {
    /// Size of the intersection of query and document token sets
    pub token_overlap: usize,
    /// `token_overlap` divided by the number of distinct query tokens (0 when none)
    pub overlap_ratio: f32,
    /// Up to `MAX_MATCHED_TOKENS` of the shared tokens
    pub matched_tokens: Vec<String>,
}

/// Split into lowercase word tokens with stop words removed.
///
/// A word is a maximal run of alphanumeric characters or underscores.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .filter(|s| !STOP_WORDS.contains(s.as_str()))
        .collect()
}

/// Distinct tokens of `text`.
pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Compare a pre-tokenized query against a document text.
pub fn match_info(query_tokens: &BTreeSet<String>, document: &str) -> MatchInfo {
    let doc_tokens = token_set(document);
    let overlap: Vec<&String> = query_tokens.intersection(&doc_tokens).collect();

    let overlap_ratio = if query_tokens.is_empty() {
        0.0
    } else {
        round3(overlap.len() as f32 / query_tokens.len() as f32)
    };

    MatchInfo {
        token_overlap: overlap.len(),
        overlap_ratio,
        matched_tokens: overlap
            .into_iter()
            .take(MAX_MATCHED_TOKENS)
            .cloned()
            .collect(),
    }
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

//! # testlog similarity
//!
//! Pure similarity functions over strings and numeric vectors, plus a
//! weighted blend and a few search helpers built on top of them.
//!
//! All scores are in `[0.0, 1.0]`, where `1.0` means identical.

pub mod blend;
pub mod metrics;

pub use blend::{
    cluster_by_similarity, find_best_match, fuzzy_match, weighted_similarity, BestMatch, Metric,
    SimilarityOptions, SimilarityWeights,
};
pub use metrics::{
    cosine_similarity, dice_similarity, jaccard_similarity, lcs_length, lcs_similarity,
    levenshtein_distance, levenshtein_similarity, ngram_similarity, tokenize,
};

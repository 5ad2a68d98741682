//! Weighted blends of the individual metrics and helpers built on them

use crate::metrics::{jaccard_similarity, lcs_similarity, levenshtein_similarity, ngram_similarity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::trace;

/// Metrics that can take part in a weighted blend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Levenshtein,
    Jaccard,
    Lcs,
    Ngram,
}

/// Per-metric weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub levenshtein: f64,
    pub jaccard: f64,
    pub lcs: f64,
    pub ngram: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            levenshtein: 0.3,
            jaccard: 0.3,
            lcs: 0.2,
            ngram: 0.2,
        }
    }
}

impl SimilarityWeights {
    fn weight(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Levenshtein => self.levenshtein,
            Metric::Jaccard => self.jaccard,
            Metric::Lcs => self.lcs,
            Metric::Ngram => self.ngram,
        }
    }
}

/// Options for [`weighted_similarity`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityOptions {
    pub weights: SimilarityWeights,
    /// Metrics included in the blend; weights are renormalized over these.
    pub metrics: BTreeSet<Metric>,
    pub ngram_size: usize,
    pub case_sensitive: bool,
}

impl Default for SimilarityOptions {
    fn default() -> Self {
        Self {
            weights: SimilarityWeights::default(),
            metrics: [Metric::Levenshtein, Metric::Jaccard, Metric::Lcs, Metric::Ngram]
                .into_iter()
                .collect(),
            ngram_size: 3,
            case_sensitive: false,
        }
    }
}

impl SimilarityOptions {
    /// Blend restricted to the given metrics, default weights otherwise.
    pub fn only(metrics: impl IntoIterator<Item = Metric>) -> Self {
        Self {
            metrics: metrics.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Weighted blend of the enabled metrics.
///
/// Weights are renormalized over the enabled metrics only, so disabling one
/// metric does not lower the maximum attainable score. With no enabled
/// metric (or all weights zero) the score degenerates to exact equality.
pub fn weighted_similarity(a: &str, b: &str, options: &SimilarityOptions) -> f64 {
    let (a, b) = if options.case_sensitive {
        (a.to_string(), b.to_string())
    } else {
        (a.to_lowercase(), b.to_lowercase())
    };

    let total_weight: f64 = options
        .metrics
        .iter()
        .map(|m| options.weights.weight(*m).max(0.0))
        .sum();
    if total_weight <= 0.0 {
        return if a == b { 1.0 } else { 0.0 };
    }

    let mut score = 0.0;
    for metric in &options.metrics {
        let weight = options.weights.weight(*metric).max(0.0);
        if weight == 0.0 {
            continue;
        }
        let value = match metric {
            Metric::Levenshtein => levenshtein_similarity(&a, &b),
            Metric::Jaccard => jaccard_similarity(&a, &b),
            Metric::Lcs => lcs_similarity(&a, &b),
            Metric::Ngram => ngram_similarity(&a, &b, options.ngram_size),
        };
        score += value * weight / total_weight;
    }

    score.clamp(0.0, 1.0)
}

/// True when the blended similarity meets `threshold`.
pub fn fuzzy_match(a: &str, b: &str, threshold: f64, options: &SimilarityOptions) -> bool {
    weighted_similarity(a, b, options) >= threshold
}

/// Result of [`find_best_match`]
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch<'a> {
    pub index: usize,
    pub candidate: &'a str,
    pub score: f64,
}

/// Best-scoring candidate at or above `threshold`.
///
/// Uses a strict `>` against the running best, so among equal scores the
/// earliest candidate wins.
pub fn find_best_match<'a, S: AsRef<str>>(
    target: &str,
    candidates: &'a [S],
    threshold: f64,
    options: &SimilarityOptions,
) -> Option<BestMatch<'a>> {
    let mut best: Option<BestMatch<'a>> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let candidate = candidate.as_ref();
        let score = weighted_similarity(target, candidate, options);
        if score < threshold {
            continue;
        }
        let better = match &best {
            Some(current) => score > current.score,
            None => true,
        };
        if better {
            best = Some(BestMatch {
                index,
                candidate,
                score,
            });
        }
    }

    best
}

/// Single-pass greedy clustering; returns clusters as index lists.
///
/// Each still-unassigned string seeds a new cluster, then every later
/// unassigned string whose similarity to the seed meets `threshold` joins
/// it. Clusters are never merged, so the result depends on input order.
pub fn cluster_by_similarity<S: AsRef<str>>(
    items: &[S],
    threshold: f64,
    options: &SimilarityOptions,
) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; items.len()];
    let mut clusters = Vec::new();

    for seed in 0..items.len() {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut cluster = vec![seed];

        for other in (seed + 1)..items.len() {
            if assigned[other] {
                continue;
            }
            let score = weighted_similarity(items[seed].as_ref(), items[other].as_ref(), options);
            if score >= threshold {
                assigned[other] = true;
                cluster.push(other);
            }
        }

        trace!(seed, members = cluster.len(), "Similarity cluster formed");
        clusters.push(cluster);
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_identity() {
        let opts = SimilarityOptions::default();
        assert!((weighted_similarity("same text", "same text", &opts) - 1.0).abs() < 1e-9);
        assert!((weighted_similarity("", "", &opts) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weights_renormalize_over_enabled_metrics() {
        // Only Jaccard enabled: blend equals plain Jaccard even though its
        // raw weight is 0.3.
        let opts = SimilarityOptions::only([Metric::Jaccard]);
        let blended = weighted_similarity("a b c", "b c d", &opts);
        assert!((blended - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_case_sensitivity() {
        let insensitive = SimilarityOptions::only([Metric::Levenshtein]);
        assert_eq!(weighted_similarity("ABC", "abc", &insensitive), 1.0);

        let sensitive = SimilarityOptions {
            case_sensitive: true,
            ..insensitive
        };
        assert_eq!(weighted_similarity("ABC", "abc", &sensitive), 0.0);
    }

    #[test]
    fn test_no_metrics_falls_back_to_equality() {
        let opts = SimilarityOptions::only([]);
        assert_eq!(weighted_similarity("x", "x", &opts), 1.0);
        assert_eq!(weighted_similarity("x", "y", &opts), 0.0);
    }

    #[test]
    fn test_fuzzy_match() {
        let opts = SimilarityOptions::default();
        assert!(fuzzy_match(
            "Expected 200 but got 404",
            "Expected 200 but got 500",
            0.7,
            &opts
        ));
        assert!(!fuzzy_match("connection refused", "assertion failed", 0.7, &opts));
    }

    #[test]
    fn test_best_match_ties_keep_earliest() {
        let opts = SimilarityOptions::default();
        let candidates = ["other", "target", "target"];
        let best = find_best_match("target", &candidates, 0.5, &opts).unwrap();
        assert_eq!(best.index, 1);
        assert_eq!(best.candidate, "target");

        assert!(find_best_match("zzz", &candidates, 0.99, &opts).is_none());
    }

    #[test]
    fn test_greedy_clusters() {
        let opts = SimilarityOptions::default();
        let items = [
            "timeout after 500ms waiting for db",
            "unexpected token in json",
            "timeout after 800ms waiting for db",
            "unexpected token in json at 4",
        ];
        let clusters = cluster_by_similarity(&items, 0.7, &opts);
        assert_eq!(clusters, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_cluster_singletons() {
        let opts = SimilarityOptions::default();
        let items = ["alpha", "omega"];
        let clusters = cluster_by_similarity(&items, 0.9, &opts);
        assert_eq!(clusters, vec![vec![0], vec![1]]);
    }
}

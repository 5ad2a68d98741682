//! Individual similarity metrics

use std::collections::HashSet;
use testlog_common::{Error, Result};

/// Edit distance between two strings, counted in chars.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two-row DP
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Levenshtein distance normalized by the longer string's length.
///
/// Two empty strings are identical (`1.0`).
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / max_len as f64
}

/// Lowercased word tokens, split on anything that is not alphanumeric or `_`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard index over word-token sets.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    set_jaccard(&set_a, &set_b)
}

/// Sørensen-Dice coefficient over word-token sets.
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    2.0 * intersection as f64 / (set_a.len() + set_b.len()) as f64
}

fn set_jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn char_ngrams(text: &str, n: usize) -> HashSet<String> {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    if chars.len() < n {
        return HashSet::new();
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

/// Jaccard index over character n-grams.
///
/// Strings shorter than `n` have no n-grams; for them the score falls back
/// to case-insensitive equality.
pub fn ngram_similarity(a: &str, b: &str, n: usize) -> f64 {
    let n = n.max(1);
    let grams_a = char_ngrams(a, n);
    let grams_b = char_ngrams(b, n);
    if grams_a.is_empty() || grams_b.is_empty() {
        return if a.to_lowercase() == b.to_lowercase() {
            1.0
        } else {
            0.0
        };
    }
    set_jaccard(&grams_a, &grams_b)
}

/// Length of the longest common subsequence, counted in chars.
pub fn lcs_length(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// LCS length divided by the longer string's length.
pub fn lcs_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    lcs_length(a, b) as f64 / max_len as f64
}

/// Cosine similarity between two equal-length vectors.
///
/// A zero vector has no direction and scores `0.0` against anything.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
        assert_eq!(levenshtein_distance("flaw", "lawn"), 2);
    }

    #[test]
    fn test_levenshtein_similarity_identity() {
        for s in ["", "a", "expected 1 to be 2", "ünïcödé"] {
            assert_eq!(levenshtein_similarity(s, s), 1.0);
        }
        assert_eq!(levenshtein_similarity("", ""), 1.0);
        assert_eq!(levenshtein_similarity("abc", ""), 0.0);
        assert!(approx(levenshtein_similarity("kitten", "sitting"), 1.0 - 3.0 / 7.0));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Expected: 'foo_bar' to equal 42!"),
            vec!["expected", "foo_bar", "to", "equal", "42"]
        );
        assert!(tokenize("  --- ").is_empty());
    }

    #[test]
    fn test_jaccard_and_dice() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
        assert_eq!(jaccard_similarity("", ""), 1.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
        // {a,b,c} vs {b,c,d}: 2 / 4
        assert!(approx(jaccard_similarity("a b c", "b c d"), 0.5));
        // 2*2 / (3+3)
        assert!(approx(dice_similarity("a b c", "b c d"), 4.0 / 6.0));
    }

    #[test]
    fn test_ngram_similarity() {
        assert_eq!(ngram_similarity("hello", "hello", 3), 1.0);
        assert_eq!(ngram_similarity("ab", "AB", 3), 1.0);
        assert_eq!(ngram_similarity("ab", "cd", 3), 0.0);
        let score = ngram_similarity("timeout after 500ms", "timeout after 800ms", 3);
        assert!(score > 0.6 && score < 1.0);
    }

    #[test]
    fn test_lcs() {
        assert_eq!(lcs_length("ABCBDAB", "BDCABA"), 4);
        assert_eq!(lcs_similarity("", ""), 1.0);
        assert!(approx(lcs_similarity("abcd", "abxd"), 0.75));
    }

    #[test]
    fn test_cosine() {
        assert!(approx(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap(), 1.0));
        assert!(approx(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 0.0));
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);

        let err = cosine_similarity(&[1.0], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { left: 1, right: 2 }));
    }
}

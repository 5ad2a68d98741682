//! Similarity-based grouping of failure messages

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use testlog_common::{Error, Result};
use testlog_similarity::{cluster_by_similarity, SimilarityOptions};
use tracing::debug;

const WILDCARD: &str = "<*>";
const MASKS: [&str; 4] = ["<str>", "<path>", "<hex>", "<num>"];

lazy_static! {
    static ref QUOTED: Regex = Regex::new(r#""[^"]*"|'[^']*'|`[^`]*`"#).unwrap();
    static ref PATH: Regex = Regex::new(r"(?:[A-Za-z]:)?(?:[\w.-]*[/\\])+[\w.-]+").unwrap();
    static ref HEX: Regex = Regex::new(r"\b0x[0-9a-fA-F]+\b|\b[0-9a-fA-F]{8,}\b").unwrap();
    static ref NUMBER: Regex = Regex::new(r"\d+(?:\.\d+)?").unwrap();
}

/// Replaces quoted strings, file paths, hex ids and numbers with fixed
/// placeholders.
pub fn mask_volatile(message: &str) -> String {
    let text = QUOTED.replace_all(message, "<str>");
    let text = PATH.replace_all(&text, "<path>");
    let text = HEX.replace_all(&text, "<hex>");
    NUMBER.replace_all(&text, "<num>").into_owned()
}

/// A failure as handed over by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FailureRecord {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Shared shape of a set of messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Masked tokens shared by all messages, `<*>` where they differ
    pub pattern: String,
    /// Literal tokens shared by all messages, first occurrence order
    pub common_elements: Vec<String>,
}

/// Extracts the token template shared by `messages`.
///
/// Messages are masked, split on whitespace and folded left to right: each
/// message is aligned against the running template by longest common token
/// subsequence, and every unaligned stretch becomes a single `<*>`.
pub fn extract_template<S: AsRef<str>>(messages: &[S]) -> Template {
    let masked: Vec<String> = messages.iter().map(|m| mask_volatile(m.as_ref())).collect();
    let Some((first, rest)) = masked.split_first() else {
        return Template {
            pattern: String::new(),
            common_elements: Vec::new(),
        };
    };

    let mut template: Vec<String> = first.split_whitespace().map(str::to_string).collect();
    for message in rest {
        let tokens: Vec<&str> = message.split_whitespace().collect();
        template = align(&template, &tokens);
    }

    let mut common_elements: Vec<String> = Vec::new();
    for token in &template {
        let literal = token != WILDCARD && !MASKS.iter().any(|m| token.contains(m));
        if literal && !common_elements.contains(token) {
            common_elements.push(token.clone());
        }
    }

    Template {
        pattern: template.join(" "),
        common_elements,
    }
}

fn align(template: &[String], tokens: &[&str]) -> Vec<String> {
    let (n, m) = (template.len(), tokens.len());
    // lcs[i][j]: common subsequence length of template[i..] and tokens[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if template[i] == tokens[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut merged = Vec::new();
    let mut gap = false;
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if template[i] == tokens[j] && template[i] != WILDCARD {
            if gap {
                merged.push(WILDCARD.to_string());
                gap = false;
            }
            merged.push(template[i].clone());
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            gap = true;
            i += 1;
        } else {
            gap = true;
            j += 1;
        }
    }
    if gap || i < n || j < m {
        merged.push(WILDCARD.to_string());
    }
    merged
}

/// A cluster of similar failures reported once
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationGroup {
    pub id: String,
    pub pattern: String,
    pub common_elements: Vec<String>,
    /// Ids of every member failure, representative included
    pub references: Vec<String>,
    pub count: usize,
    pub representative: FailureRecord,
}

/// Output of [`DeduplicationService::compress`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    /// Ungrouped failures plus one representative per group, input order
    pub failures: Vec<FailureRecord>,
    pub groups: Vec<DeduplicationGroup>,
    pub original_count: usize,
    pub compressed_count: usize,
    /// `compressed_count / original_count`; 1.0 for empty input
    pub compression_ratio: f64,
}

/// Grouping parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingOptions {
    pub threshold: f64,
    pub similarity: SimilarityOptions,
    pub min_group_size: usize,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            similarity: SimilarityOptions::default(),
            min_group_size: 2,
        }
    }
}

impl GroupingOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::validation(format!(
                "similarity threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.min_group_size < 2 {
            return Err(Error::validation("min_group_size must be at least 2"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeduplicationService {
    options: GroupingOptions,
}

impl DeduplicationService {
    pub fn new(options: GroupingOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &GroupingOptions {
        &self.options
    }

    /// Groups failures whose masked messages are similar.
    ///
    /// Clustering is greedy and order-dependent: earlier failures seed
    /// groups. Clusters below `min_group_size` are not reported.
    pub fn group_failures(&self, failures: &[FailureRecord]) -> Vec<DeduplicationGroup> {
        self.clusters(failures)
            .into_iter()
            .filter(|members| members.len() >= self.options.min_group_size)
            .enumerate()
            .map(|(n, members)| self.build_group(n + 1, failures, &members))
            .collect()
    }

    /// Replaces every group by its representative.
    pub fn compress(&self, failures: &[FailureRecord]) -> CompressionResult {
        let mut kept: Vec<usize> = Vec::new();
        let mut groups = Vec::new();

        for members in self.clusters(failures) {
            if members.len() >= self.options.min_group_size {
                kept.push(members[0]);
                groups.push(self.build_group(groups.len() + 1, failures, &members));
            } else {
                kept.extend(members);
            }
        }
        kept.sort_unstable();

        let original_count = failures.len();
        let compressed_count = kept.len();
        let compression_ratio = if original_count == 0 {
            1.0
        } else {
            compressed_count as f64 / original_count as f64
        };
        debug!(
            original_count,
            compressed_count,
            groups = groups.len(),
            "Failures compressed"
        );

        CompressionResult {
            failures: kept.into_iter().map(|i| failures[i].clone()).collect(),
            groups,
            original_count,
            compressed_count,
            compression_ratio,
        }
    }

    fn clusters(&self, failures: &[FailureRecord]) -> Vec<Vec<usize>> {
        let masked: Vec<String> = failures.iter().map(|f| mask_volatile(&f.message)).collect();
        cluster_by_similarity(&masked, self.options.threshold, &self.options.similarity)
    }

    fn build_group(&self, n: usize, failures: &[FailureRecord], members: &[usize]) -> DeduplicationGroup {
        let messages: Vec<&str> = members.iter().map(|i| failures[*i].message.as_str()).collect();
        let template = extract_template(&messages);
        DeduplicationGroup {
            id: format!("group-{}", n),
            pattern: template.pattern,
            common_elements: template.common_elements,
            references: members.iter().map(|i| failures[*i].id.clone()).collect(),
            count: members.len(),
            representative: failures[members[0]].clone(),
        }
    }
}

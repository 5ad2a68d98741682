//! Priority-based section removal

use crate::estimator::{TokenEstimator, DEFAULT_CHARS_PER_TOKEN};
use serde::{Deserialize, Serialize};
use testlog_common::{Error, Result};
use tracing::debug;

/// Separator between sections of an assembled report
pub const SECTION_SEPARATOR: &str = "\n\n";

const ELLIPSIS: &str = "…";

/// Section priority, lowest first. Lower priorities are removed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionPriority {
    PassedLogs,
    ConsoleOutput,
    Metadata,
    FailureDetail,
    /// Never removed
    Summary,
}

/// One removable unit of an assembled report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub priority: SectionPriority,
    pub content: String,
}

impl Section {
    pub fn new(id: impl Into<String>, priority: SectionPriority, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    pub max_tokens: usize,
    pub chars_per_token: f64,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TruncationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::validation("max_tokens must be greater than 0"));
        }
        TokenEstimator::new(self.chars_per_token).map(|_| ())
    }
}

/// Outcome of [`TruncationPolicy::apply`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncationResult {
    /// Surviving sections in their original order
    pub sections: Vec<Section>,
    /// Removed section ids, in removal order
    pub removed: Vec<String>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// False when only summaries remain and they still exceed the budget
    pub within_budget: bool,
}

#[derive(Debug, Clone)]
pub struct TruncationPolicy {
    max_tokens: usize,
    estimator: TokenEstimator,
}

impl TruncationPolicy {
    pub fn new(config: &TruncationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_tokens: config.max_tokens,
            estimator: TokenEstimator::new(config.chars_per_token)?,
        })
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Removes whole sections until the estimate of the assembled output
    /// (see [`assemble`]) is within budget.
    ///
    /// Lowest priority goes first; within a priority the latest section goes
    /// first. Summary sections are kept regardless.
    pub fn apply(&self, sections: Vec<Section>) -> TruncationResult {
        let lengths: Vec<usize> = sections.iter().map(|s| s.content.chars().count()).collect();
        let separator = SECTION_SEPARATOR.chars().count();
        let assembled_chars = |kept: usize, content: usize| {
            content + separator * kept.saturating_sub(1)
        };

        let mut kept = sections.len();
        let mut content_chars: usize = lengths.iter().sum();
        let tokens_before = self
            .estimator
            .estimate_chars(assembled_chars(kept, content_chars));

        let mut order: Vec<usize> = (0..sections.len())
            .filter(|i| sections[*i].priority != SectionPriority::Summary)
            .collect();
        order.sort_by(|a, b| {
            sections[*a]
                .priority
                .cmp(&sections[*b].priority)
                .then(b.cmp(a))
        });

        let mut removed_mask = vec![false; sections.len()];
        let mut removed = Vec::new();
        let mut total = tokens_before;
        for index in order {
            if total <= self.max_tokens {
                break;
            }
            removed_mask[index] = true;
            removed.push(sections[index].id.clone());
            kept -= 1;
            content_chars -= lengths[index];
            total = self
                .estimator
                .estimate_chars(assembled_chars(kept, content_chars));
        }

        if !removed.is_empty() {
            debug!(
                removed = removed.len(),
                tokens_before,
                tokens_after = total,
                max_tokens = self.max_tokens,
                "Report sections truncated"
            );
        }

        TruncationResult {
            sections: sections
                .into_iter()
                .zip(removed_mask)
                .filter_map(|(section, gone)| (!gone).then_some(section))
                .collect(),
            removed,
            tokens_before,
            tokens_after: total,
            within_budget: total <= self.max_tokens,
        }
    }

    /// Shortens `text` at a line boundary to fit `max_tokens`, appending a
    /// marker with the number of dropped lines. Text that already fits is
    /// returned unchanged. When not even the marker fits, a bare ellipsis
    /// (or nothing, for a zero budget) is returned.
    pub fn truncate_text(&self, text: &str, max_tokens: usize) -> String {
        if !self.estimator.exceeds_token_limit(text, max_tokens) {
            return text.to_string();
        }
        let budget = self.estimator.max_chars_for_tokens(max_tokens);
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let reserve = truncation_marker(lines.len()).chars().count() + 1;

        let mut kept = String::new();
        let mut kept_chars = 0;
        let mut kept_lines = 0;
        for line in &lines {
            let chars = line.chars().count();
            if kept_chars + chars + reserve > budget {
                break;
            }
            kept.push_str(line);
            kept_chars += chars;
            kept_lines += 1;
        }

        let marker = truncation_marker(lines.len() - kept_lines);
        if kept.is_empty() && marker.chars().count() > budget {
            return if budget > 0 {
                ELLIPSIS.to_string()
            } else {
                String::new()
            };
        }
        if !kept.is_empty() && !kept.ends_with('\n') {
            kept.push('\n');
        }
        kept.push_str(&marker);
        kept
    }
}

/// Joins sections the way a report renders them.
pub fn assemble(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

fn truncation_marker(dropped_lines: usize) -> String {
    format!("{} [truncated {} lines]", ELLIPSIS, dropped_lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_tokens: usize) -> TruncationPolicy {
        TruncationPolicy::new(&TruncationConfig {
            max_tokens,
            ..TruncationConfig::default()
        })
        .unwrap()
    }

    fn ten_tokens(id: &str, priority: SectionPriority) -> Section {
        Section::new(id, priority, "x".repeat(40))
    }

    #[test]
    fn test_lowest_priority_latest_first() {
        let sections = vec![
            ten_tokens("summary", SectionPriority::Summary),
            ten_tokens("passed-1", SectionPriority::PassedLogs),
            ten_tokens("failure", SectionPriority::FailureDetail),
            ten_tokens("passed-2", SectionPriority::PassedLogs),
            ten_tokens("console", SectionPriority::ConsoleOutput),
        ];
        // 5 x 40 chars plus 4 separators of 2 chars: 208 chars, 52 tokens
        let result = policy(31).apply(sections);

        assert_eq!(result.removed, vec!["passed-2", "passed-1"]);
        assert_eq!(result.tokens_before, 52);
        assert_eq!(result.tokens_after, 31);
        assert!(result.within_budget);
        let kept: Vec<&str> = result.sections.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(kept, vec!["summary", "failure", "console"]);
    }

    #[test]
    fn test_under_budget_is_untouched() {
        let sections = vec![ten_tokens("a", SectionPriority::PassedLogs)];
        let result = policy(10).apply(sections.clone());
        assert!(result.removed.is_empty());
        assert_eq!(result.sections, sections);
    }

    #[test]
    fn test_summary_is_never_removed() {
        let sections = vec![
            ten_tokens("summary", SectionPriority::Summary),
            ten_tokens("console", SectionPriority::ConsoleOutput),
        ];
        let result = policy(5).apply(sections);
        assert_eq!(result.removed, vec!["console"]);
        assert_eq!(result.sections.len(), 1);
        assert_eq!(result.tokens_after, 10);
        assert!(!result.within_budget);
    }

    #[test]
    fn test_budget_counts_separators_of_assembled_output() {
        // Each section alone rounds to 1 token, so per-section sums say 4.
        let sections: Vec<Section> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| Section::new(*id, SectionPriority::PassedLogs, "x"))
            .collect();
        // Assembled: "x\n\nx\n\nx\n\nx" is 10 chars, 3 tokens.
        assert_eq!(assemble(&sections).chars().count(), 10);

        let result = policy(2).apply(sections);
        assert_eq!(result.tokens_before, 3);
        assert_eq!(result.removed, vec!["d"]);
        assert_eq!(result.tokens_after, 2);
        assert_eq!(
            policy(2).estimator().estimate_tokens(&assemble(&result.sections)),
            result.tokens_after
        );
    }

    #[test]
    fn test_truncate_text_when_marker_does_not_fit() {
        let text: String = (0..10).map(|i| format!("row {}\n", i)).collect();
        let policy = policy(100);

        let tiny = policy.truncate_text(&text, 1);
        assert_eq!(tiny, "…");
        assert!(policy.estimator().estimate_tokens(&tiny) <= 1);
        assert_eq!(policy.truncate_text(&text, 0), "");
    }

    #[test]
    fn test_truncate_text_at_line_boundary() {
        let text: String = (0..10).map(|i| format!("row {}\n", i)).collect();
        let policy = policy(100);
        let short = policy.truncate_text(&text, 10);

        assert_eq!(short, "row 0\nrow 1\n… [truncated 8 lines]");
        assert!(policy.estimator().estimate_tokens(&short) <= 10);
        assert_eq!(policy.truncate_text("fits", 10), "fits");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(TruncationPolicy::new(&TruncationConfig {
            max_tokens: 0,
            ..TruncationConfig::default()
        })
        .is_err());
        assert!(TruncationPolicy::new(&TruncationConfig {
            chars_per_token: 0.0,
            ..TruncationConfig::default()
        })
        .is_err());
    }
}

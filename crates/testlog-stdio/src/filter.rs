//! Filter rules and framework banner presets

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use testlog_common::{Error, Result};

/// Which lines a stream filter suppresses
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPattern {
    /// No filtering; every line passes (unless presets are configured)
    #[default]
    Unset,
    /// Pure mode: every line is suppressed
    SuppressAll,
    /// Lines matching any pattern are suppressed
    Patterns(Vec<String>),
}

impl FilterPattern {
    pub fn single(pattern: impl Into<String>) -> Self {
        FilterPattern::Patterns(vec![pattern.into()])
    }
}

/// Banner signatures of common dev-server and test frameworks
const PRESETS: &[(&str, &[&str])] = &[
    ("nest", &[r"^\[Nest\]", r"^\s*\[Nest\]\s+\d+\s+-"]),
    ("next", &[r"^\s*▲ Next\.js", r"^\s*- (Local|Network|Environments):", r"^\s*✓ (Ready|Compiled)"]),
    ("vite", &[r"^\s*VITE v\d", r"^\s*➜\s+(Local|Network):", r"^\[vite\]"]),
    ("webpack", &[r"^webpack \d", r"^\s*\[webpack-dev-server\]", r"^<[iwe]> \[webpack"]),
    ("angular", &[r"^\*\* Angular Live Development Server", r"^Build at: ", r"^✔ (Browser application bundle|Compiled successfully)"]),
    ("jest", &[r"^\s*console\.(log|info|warn|error|debug)$", r"^Determining test suites to run"]),
    ("npm", &[r"^npm (WARN|notice)", r"^> [\w@/.-]+@\d"]),
];

/// Names of all framework presets
pub fn preset_names() -> Vec<&'static str> {
    PRESETS.iter().map(|(name, _)| *name).collect()
}

/// Pattern set behind a named preset
pub fn preset_patterns(name: &str) -> Option<&'static [&'static str]> {
    PRESETS
        .iter()
        .find(|(preset, _)| preset.eq_ignore_ascii_case(name))
        .map(|(_, patterns)| *patterns)
}

#[derive(Debug, Clone)]
enum RuleMode {
    PassAll,
    SuppressAll,
    Match(RegexSet),
}

/// Compiled suppression rule; read-only once built
#[derive(Debug, Clone)]
pub struct FilterRule {
    mode: RuleMode,
}

impl FilterRule {
    /// Compiles `pattern` plus the named `presets` (OR-combined).
    ///
    /// Presets add to explicit patterns and turn an unset pattern into a
    /// preset-only filter; pure mode ignores presets.
    pub fn new(pattern: &FilterPattern, presets: &[String]) -> Result<Self> {
        let mut sources: Vec<String> = Vec::new();
        for name in presets {
            let patterns = preset_patterns(name).ok_or_else(|| Error::unknown_preset(name))?;
            sources.extend(patterns.iter().map(|p| p.to_string()));
        }

        let mode = match pattern {
            FilterPattern::SuppressAll => RuleMode::SuppressAll,
            FilterPattern::Unset if sources.is_empty() => RuleMode::PassAll,
            FilterPattern::Unset => RuleMode::Match(compile(&sources)?),
            FilterPattern::Patterns(patterns) => {
                for p in patterns {
                    if p.is_empty() {
                        return Err(Error::invalid_pattern(p, "empty pattern matches every line"));
                    }
                }
                sources.extend(patterns.iter().cloned());
                if sources.is_empty() {
                    RuleMode::PassAll
                } else {
                    RuleMode::Match(compile(&sources)?)
                }
            }
        };

        Ok(Self { mode })
    }

    /// Rule that suppresses nothing
    pub fn pass_all() -> Self {
        Self {
            mode: RuleMode::PassAll,
        }
    }

    /// True when `line` (without its newline) should be suppressed.
    pub fn matches(&self, line: &str) -> bool {
        match &self.mode {
            RuleMode::PassAll => false,
            RuleMode::SuppressAll => true,
            RuleMode::Match(set) => set.is_match(line),
        }
    }

    pub fn is_pure(&self) -> bool {
        matches!(self.mode, RuleMode::SuppressAll)
    }

    pub fn is_pass_all(&self) -> bool {
        matches!(self.mode, RuleMode::PassAll)
    }
}

fn compile(sources: &[String]) -> Result<RegexSet> {
    // Compile individually first so the error names the offending pattern.
    for source in sources {
        regex::Regex::new(source).map_err(|e| Error::invalid_pattern(source, e.to_string()))?;
    }
    RegexSet::new(sources).map_err(|e| Error::invalid_pattern(sources.join(" | "), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_passes_everything() {
        let rule = FilterRule::new(&FilterPattern::Unset, &[]).unwrap();
        assert!(rule.is_pass_all());
        assert!(!rule.matches("[Nest] 1 - started"));
    }

    #[test]
    fn test_pure_mode_suppresses_everything() {
        let rule = FilterRule::new(&FilterPattern::SuppressAll, &["nest".to_string()]).unwrap();
        assert!(rule.is_pure());
        assert!(rule.matches(""));
        assert!(rule.matches("anything at all"));
    }

    #[test]
    fn test_patterns_are_or_combined() {
        let rule = FilterRule::new(
            &FilterPattern::Patterns(vec![r"^DEBUG".into(), r"heartbeat".into()]),
            &[],
        )
        .unwrap();
        assert!(rule.matches("DEBUG cache warm"));
        assert!(rule.matches("sent heartbeat #3"));
        assert!(!rule.matches("test failed"));
    }

    #[test]
    fn test_presets_expand() {
        let rule = FilterRule::new(&FilterPattern::Unset, &["Nest".to_string(), "vite".to_string()])
            .unwrap();
        assert!(rule.matches("[Nest] 4120  - 01/02/2024 LOG [NestFactory] Starting"));
        assert!(rule.matches("  VITE v5.0.2  ready in 312 ms"));
        assert!(!rule.matches("expected true to be false"));
    }

    #[test]
    fn test_preset_combined_with_pattern() {
        let rule = FilterRule::new(&FilterPattern::single("^noise"), &["npm".to_string()]).unwrap();
        assert!(rule.matches("noise level high"));
        assert!(rule.matches("npm WARN deprecated"));
    }

    #[test]
    fn test_unknown_preset_and_bad_pattern_rejected() {
        let err = FilterRule::new(&FilterPattern::Unset, &["rails".to_string()]).unwrap_err();
        assert!(matches!(err, Error::UnknownPreset { .. }));

        let err = FilterRule::new(&FilterPattern::single("(unclosed"), &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));

        let err = FilterRule::new(&FilterPattern::single(""), &[]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_every_preset_compiles() {
        for name in preset_names() {
            FilterRule::new(&FilterPattern::Unset, &[name.to_string()]).unwrap();
        }
    }
}

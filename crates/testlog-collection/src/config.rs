use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use testlog_capture::CaptureConfig;
use testlog_dedup::DeduplicationConfig;
use testlog_stdio::{FilterPattern, StdioOptions};
use testlog_truncation::TruncationConfig;

/// Top-level configuration of the log pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReporterLogConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub stdio: StdioSettings,
    #[serde(default)]
    pub deduplication: DeduplicationConfig,
    #[serde(default)]
    pub truncation: TruncationConfig,
}

/// Console capture options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_grace_period", with = "duration_serde")]
    pub grace_period: Duration,
    #[serde(default = "default_true")]
    pub patch_console: bool,
    #[serde(default)]
    pub passthrough: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: default_max_bytes(),
            max_lines: default_max_lines(),
            grace_period: default_grace_period(),
            patch_console: true,
            passthrough: false,
        }
    }
}

impl CaptureSettings {
    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            enabled: self.enabled,
            max_bytes: self.max_bytes,
            max_lines: self.max_lines,
            grace_period: self.grace_period,
            patch_console: self.patch_console,
            passthrough: self.passthrough,
        }
    }
}

/// Stdio filtering options.
///
/// `filter_pattern` is tri-state: key absent means no filtering, an explicit
/// `null` means pure mode, a string or list of strings gives the patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioSettings {
    #[serde(default = "default_true")]
    pub suppress_stdout: bool,
    #[serde(default)]
    pub suppress_stderr: bool,
    #[serde(
        default,
        with = "filter_pattern_serde",
        skip_serializing_if = "filter_pattern_serde::is_unset"
    )]
    pub filter_pattern: FilterPattern,
    #[serde(default)]
    pub framework_presets: Vec<String>,
    #[serde(default)]
    pub redirect_to_stderr: bool,
    #[serde(default)]
    pub flush_with_filtering: bool,
    /// Install filtering writers into the process stream slots, routing
    /// writes made inside a running unit to that unit
    #[serde(default = "default_true")]
    pub patch_streams: bool,
}

impl Default for StdioSettings {
    fn default() -> Self {
        Self {
            suppress_stdout: true,
            suppress_stderr: false,
            filter_pattern: FilterPattern::Unset,
            framework_presets: Vec::new(),
            redirect_to_stderr: false,
            flush_with_filtering: false,
            patch_streams: true,
        }
    }
}

impl StdioSettings {
    pub fn to_options(&self) -> StdioOptions {
        StdioOptions {
            suppress_stdout: self.suppress_stdout,
            suppress_stderr: self.suppress_stderr,
            filter_pattern: self.filter_pattern.clone(),
            framework_presets: self.framework_presets.clone(),
            redirect_to_stderr: self.redirect_to_stderr,
            flush_with_filtering: self.flush_with_filtering,
        }
    }
}

impl ReporterLogConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: ReporterLogConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.capture
            .to_capture_config()
            .validate()
            .context("Invalid capture configuration")?;
        if self.capture.grace_period > Duration::from_secs(60) {
            return Err(anyhow!(
                "Capture grace period too long (max 60s): {:?}",
                self.capture.grace_period
            ));
        }

        self.stdio
            .to_options()
            .compile()
            .context("Invalid stdio configuration")?;
        self.deduplication
            .validate()
            .context("Invalid deduplication configuration")?;
        self.truncation
            .validate()
            .context("Invalid truncation configuration")?;
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_bytes() -> usize {
    50_000
}

fn default_max_lines() -> usize {
    1_000
}

fn default_grace_period() -> Duration {
    Duration::from_millis(100)
}

// Custom serialization for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" before "s", since "ms" ends with 's'
        if let Some(num) = s.strip_suffix("ms") {
            let millis: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_millis(millis))
        } else if let Some(num) = s.strip_suffix('s') {
            let secs: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(secs))
        } else if let Some(num) = s.strip_suffix('m') {
            let mins: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(mins * 60))
        } else {
            Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
        }
    }
}

// Tri-state filter pattern: absent / null / string-or-list
mod filter_pattern_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use testlog_stdio::FilterPattern;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn is_unset(pattern: &FilterPattern) -> bool {
        matches!(pattern, FilterPattern::Unset)
    }

    pub fn serialize<S>(pattern: &FilterPattern, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match pattern {
            FilterPattern::Unset | FilterPattern::SuppressAll => serializer.serialize_none(),
            FilterPattern::Patterns(patterns) => patterns.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<FilterPattern, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
            None => FilterPattern::SuppressAll,
            Some(OneOrMany::One(pattern)) => FilterPattern::Patterns(vec![pattern]),
            Some(OneOrMany::Many(patterns)) => FilterPattern::Patterns(patterns),
        })
    }
}

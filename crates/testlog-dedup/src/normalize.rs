//! Message normalization for dedup keys

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ANSI_ESCAPE: Regex = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap();
    static ref ISO_TIMESTAMP: Regex = Regex::new(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?"
    )
    .unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Which normalization steps run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub strip_ansi_codes: bool,
    pub strip_timestamps: bool,
    pub normalize_whitespace: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            strip_ansi_codes: true,
            strip_timestamps: true,
            normalize_whitespace: true,
        }
    }
}

/// ANSI-strip, timestamp-strip, whitespace-collapse, then lowercase.
pub fn normalize_message(message: &str, options: NormalizeOptions) -> String {
    let mut text = message.to_string();
    if options.strip_ansi_codes {
        text = ANSI_ESCAPE.replace_all(&text, "").into_owned();
    }
    if options.strip_timestamps {
        text = ISO_TIMESTAMP.replace_all(&text, "").into_owned();
    }
    if options.normalize_whitespace {
        text = WHITESPACE.replace_all(text.trim(), " ").into_owned();
    }
    text.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_normalization() {
        let raw = "\x1b[31m2024-03-01T12:00:05.123Z  Connection   REFUSED\x1b[0m\n";
        assert_eq!(
            normalize_message(raw, NormalizeOptions::default()),
            "connection refused"
        );
    }

    #[test]
    fn test_steps_are_independent() {
        let raw = "\x1b[1mAt 2024-03-01 12:00:05+02:00\x1b[0m  done";

        let keep_ansi = NormalizeOptions {
            strip_ansi_codes: false,
            ..NormalizeOptions::default()
        };
        assert_eq!(normalize_message(raw, keep_ansi), "\x1b[1mat \x1b[0m done");

        let keep_time = NormalizeOptions {
            strip_timestamps: false,
            ..NormalizeOptions::default()
        };
        assert_eq!(normalize_message(raw, keep_time), "at 2024-03-01 12:00:05+02:00 done");

        let keep_space = NormalizeOptions {
            normalize_whitespace: false,
            ..NormalizeOptions::default()
        };
        assert_eq!(normalize_message(raw, keep_space), "at   done");
    }

    #[test]
    fn test_lowercase_always_applies() {
        let off = NormalizeOptions {
            strip_ansi_codes: false,
            strip_timestamps: false,
            normalize_whitespace: false,
        };
        assert_eq!(normalize_message("Mixed Case", off), "mixed case");
    }
}

//! Startup configuration for the cflat runtime.
//!
//! The heap size and the GC log flag come from environment variables set by
//! whoever launches the compiled program:
//!
//! - `CFLAT_HEAP_WORDS` (required): total heap size in machine words, a
//!   positive even number in plain decimal digits. Half of it is allocatable
//!   at any one time; the other half is the collector's copy target.
//! - `CFLAT_GC_LOG` (optional): the literal string `"1"` turns on the
//!   collection log; anything else leaves it off.

use std::fmt;

/// Environment variable holding the total heap size in words.
pub const HEAP_WORDS_VAR: &str = "CFLAT_HEAP_WORDS";

/// Environment variable enabling the GC log when set to `"1"`.
pub const GC_LOG_VAR: &str = "CFLAT_GC_LOG";

/// Validated startup configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Total heap size in words. Always positive and even.
    pub heap_words: usize,
    /// Whether the collector prints its log to stdout.
    pub gc_log: bool,
}

/// Configuration failures. All of them are fatal at startup; the `Display`
/// text is the exact message the program prints before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `CFLAT_HEAP_WORDS` is not set (or is set to the empty string).
    HeapWordsMissing,
    /// `CFLAT_HEAP_WORDS` is set but is not a positive even decimal number.
    HeapWordsInvalid,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::HeapWordsMissing => f.write_str(
                "The CFLAT_HEAP_WORDS environment variable must be set to \
                 the desired size of the heap (in words).",
            ),
            ConfigError::HeapWordsInvalid => f.write_str(
                "CFLAT_HEAP_WORDS must contain a positive even number with \
                 no trailing spaces.",
            ),
        }
    }
}

impl HeapConfig {
    /// Read and validate the configuration from the process environment.
    pub fn from_env() -> Result<HeapConfig, ConfigError> {
        let heap_words = std::env::var(HEAP_WORDS_VAR).ok();
        let gc_log = std::env::var(GC_LOG_VAR).ok();
        Self::parse(heap_words.as_deref(), gc_log.as_deref())
    }

    /// Validate raw variable values.
    ///
    /// The heap size must be decimal digits only: no sign, no whitespace, no
    /// separators. A value that overflows a machine word is rejected the
    /// same way as any other malformed value.
    fn parse(heap_words: Option<&str>, gc_log: Option<&str>) -> Result<HeapConfig, ConfigError> {
        let raw = match heap_words {
            None | Some("") => return Err(ConfigError::HeapWordsMissing),
            Some(raw) => raw,
        };

        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::HeapWordsInvalid);
        }
        let heap_words: usize = raw.parse().map_err(|_| ConfigError::HeapWordsInvalid)?;
        if heap_words == 0 || heap_words % 2 == 1 {
            return Err(ConfigError::HeapWordsInvalid);
        }

        Ok(HeapConfig {
            heap_words,
            gc_log: gc_log == Some("1"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let config = HeapConfig::parse(Some("16"), None).unwrap();
        assert_eq!(config.heap_words, 16);
        assert!(!config.gc_log);
    }

    #[test]
    fn test_parse_missing_or_empty() {
        assert_eq!(
            HeapConfig::parse(None, None),
            Err(ConfigError::HeapWordsMissing)
        );
        assert_eq!(
            HeapConfig::parse(Some(""), None),
            Err(ConfigError::HeapWordsMissing)
        );
    }

    #[test]
    fn test_parse_rejects_non_digits() {
        for raw in ["16 ", " 16", "+16", "-16", "0x10", "sixteen", "1_6"] {
            assert_eq!(
                HeapConfig::parse(Some(raw), None),
                Err(ConfigError::HeapWordsInvalid),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_zero_and_odd() {
        assert_eq!(
            HeapConfig::parse(Some("0"), None),
            Err(ConfigError::HeapWordsInvalid)
        );
        assert_eq!(
            HeapConfig::parse(Some("7"), None),
            Err(ConfigError::HeapWordsInvalid)
        );
    }

    #[test]
    fn test_parse_rejects_overflow() {
        // 2^64, one past the largest machine word.
        assert_eq!(
            HeapConfig::parse(Some("18446744073709551616"), None),
            Err(ConfigError::HeapWordsInvalid)
        );
    }

    #[test]
    fn test_gc_log_flag() {
        assert!(HeapConfig::parse(Some("8"), Some("1")).unwrap().gc_log);
        for raw in ["0", "true", "", "01", "1 "] {
            assert!(
                !HeapConfig::parse(Some("8"), Some(raw)).unwrap().gc_log,
                "{raw:?} should leave logging off"
            );
        }
    }
}

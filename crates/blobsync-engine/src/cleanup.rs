//! Post-apply cleanup pattern
//!
//! Compiled on first use. A malformed pattern is reported once and the
//! cleanup stays off for the life of the engine.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Default)]
pub struct CleanupFilter {
    pattern: Option<String>,
    compiled: OnceLock<Option<Regex>>,
}

impl CleanupFilter {
    pub fn new(pattern: Option<String>) -> Self {
        Self {
            pattern,
            compiled: OnceLock::new(),
        }
    }

    /// The compiled pattern, or `None` when unset or invalid
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| {
                let pattern = self.pattern.as_deref()?;
                match compile(pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!(error = %e, "Post-apply cleanup disabled");
                        None
                    }
                }
            })
            .as_ref()
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

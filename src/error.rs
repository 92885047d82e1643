//! Custom error types for Warden.
//!
//! Every boundary operation in the crate returns [`Result`]. Components never
//! decide on their own that a failure means "allow"; the hook layer does that
//! explicitly so the fail-open policy stays visible and testable.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Warden operations
#[derive(Error, Debug)]
pub enum WardenError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Rule Loading Errors
    // =========================================================================
    /// A rule entry could not be decoded into a known matcher
    #[error("Invalid rule '{rule_id}' in {section}: {reason}")]
    InvalidRule {
        section: String,
        rule_id: String,
        reason: String,
    },

    /// Two rules share the same ID
    #[error("Duplicate rule id '{rule_id}' (sections {first} and {second})")]
    DuplicateRule {
        rule_id: String,
        first: String,
        second: String,
    },

    /// A rule pattern failed to compile
    #[error("Rule '{rule_id}' has an invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// A state file exists but does not hold valid JSON
    #[error("Corrupt state file {path}: {message}")]
    CorruptState { path: PathBuf, message: String },

    /// The state key cannot be mapped to a file name
    #[error("Invalid state key '{key}'")]
    InvalidStateKey { key: String },

    /// The store returned without running the update closure
    #[error("State update for '{key}' did not run")]
    UpdateSkipped { key: String },

    // =========================================================================
    // Hook Errors
    // =========================================================================
    /// Hook input could not be parsed
    #[error("Malformed hook input: {reason}")]
    HookInput { reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML error wrapper
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl WardenError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a rule decoding error
    pub fn invalid_rule(
        section: impl Into<String>,
        rule_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidRule {
            section: section.into(),
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a hook input error
    pub fn hook_input(reason: impl Into<String>) -> Self {
        Self::HookInput {
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error came from loading rules or configuration.
    ///
    /// Callers fall back to the built-in defaults for these.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::InvalidRule { .. }
                | Self::DuplicateRule { .. }
                | Self::InvalidPattern { .. }
                | Self::Yaml(_)
        )
    }

    /// Check if this error came from persisted state
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::CorruptState { .. }
                | Self::InvalidStateKey { .. }
                | Self::UpdateSkipped { .. }
                | Self::Io(_)
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::InvalidRule { .. } | Self::DuplicateRule { .. } | Self::InvalidPattern { .. } => {
                8
            }
            Self::CorruptState { .. } | Self::InvalidStateKey { .. } => 9,
            _ => 1,
        }
    }
}

/// Type alias for Warden results
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WardenError::invalid_rule("bash_rules", "nul-redirect", "unknown check 'glob'");
        let msg = err.to_string();
        assert!(msg.contains("nul-redirect"));
        assert!(msg.contains("bash_rules"));
        assert!(msg.contains("glob"));
    }

    #[test]
    fn test_duplicate_rule_display() {
        let err = WardenError::DuplicateRule {
            rule_id: "sensitive-files".into(),
            first: "write_rules".into(),
            second: "read_rules".into(),
        };
        assert!(err.to_string().contains("write_rules"));
        assert!(err.to_string().contains("read_rules"));
    }

    #[test]
    fn test_is_config_error() {
        assert!(WardenError::config("bad").is_config_error());
        assert!(WardenError::invalid_rule("s", "r", "x").is_config_error());
        assert!(!WardenError::hook_input("eof").is_config_error());
    }

    #[test]
    fn test_is_state_error() {
        let err = WardenError::CorruptState {
            path: PathBuf::from("state/api-health.json"),
            message: "expected value".into(),
        };
        assert!(err.is_state_error());
        assert!(!WardenError::config("bad").is_state_error());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WardenError::config("test").exit_code(), 7);
        assert_eq!(WardenError::invalid_rule("s", "r", "x").exit_code(), 8);
        assert_eq!(
            WardenError::InvalidStateKey { key: "../x".into() }.exit_code(),
            9
        );
        assert_eq!(WardenError::hook_input("eof").exit_code(), 1);
    }
}

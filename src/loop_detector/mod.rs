//! Repeated-behavior detection for agent sessions.
//!
//! Three tiers are checked per tool call, first positive tier wins:
//!
//! 1. **Tool hash** - the last N `(tool, params)` signatures are identical
//! 2. **Content hash** - the last M outputs are identical
//! 3. **Excessive turns** - the session exceeded its call budget
//!
//! Each hook invocation is a separate process, so the windows live in a
//! [`LoopWindowState`] persisted between calls by [`LoopTracker`].

pub mod tracker;
pub mod types;

pub use tracker::{session_key, LoopTracker};
pub use types::{LoopDetectorConfig, LoopType, LoopVerdict, LoopWindowState, DEFAULT_MAX_TURNS};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Result, WardenError};
use types::{is_saturated, push_bounded};

/// Hex characters kept from each SHA-256 digest.
const HASH_CHARS: usize = 16;

/// Stateless loop checker with a compiled whitelist.
///
/// # Example
///
/// ```rust
/// use warden::loop_detector::{LoopDetector, LoopDetectorConfig, LoopType, LoopWindowState};
///
/// let detector = LoopDetector::new(LoopDetectorConfig::default()).unwrap();
/// let mut state = LoopWindowState::default();
/// let mut last = None;
/// for i in 0..5 {
///     last = Some(detector.check(&mut state, "Bash", "ls -la", &format!("out {i}")));
/// }
/// assert_eq!(last.unwrap().loop_type, Some(LoopType::ToolHash));
/// ```
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    whitelist: Vec<Regex>,
    agent_type: String,
}

impl LoopDetector {
    /// Create a detector for the `default` agent type.
    ///
    /// # Errors
    ///
    /// Returns an error if a whitelist pattern is not a valid regex.
    pub fn new(config: LoopDetectorConfig) -> Result<Self> {
        let whitelist = config
            .whitelist
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| WardenError::InvalidConfig {
                    field: "loop_detection.whitelist".to_string(),
                    reason: format!("'{}': {}", pattern, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            whitelist,
            agent_type: "default".to_string(),
        })
    }

    /// Set the agent type used to pick the call budget.
    #[must_use]
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    /// Get the detector configuration.
    #[must_use]
    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Get the active agent type.
    #[must_use]
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Returns true if `params_summary` is a known benign repeat.
    #[must_use]
    pub fn is_whitelisted(&self, params_summary: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(params_summary))
    }

    /// Check one tool call and fold it into `state`.
    ///
    /// The call counter always advances. Whitelisted calls leave both windows
    /// untouched.
    pub fn check(
        &self,
        state: &mut LoopWindowState,
        tool_name: &str,
        params_summary: &str,
        output: &str,
    ) -> LoopVerdict {
        let tool_capacity = self.config.tool_capacity();
        let content_capacity = self.config.content_capacity();
        state.truncate_to(tool_capacity, content_capacity);
        state.session_call_count = state.session_call_count.saturating_add(1);
        let count = state.session_call_count;
        let warning_only = self.config.warning_mode;

        if self.is_whitelisted(params_summary) {
            return LoopVerdict::clear("Whitelisted operation", count);
        }

        let tool_hash = tool_hash(tool_name, params_summary);
        push_bounded(&mut state.tool_hash_window, tool_hash, tool_capacity);
        if is_saturated(&state.tool_hash_window, tool_capacity) {
            return LoopVerdict::detected(
                LoopType::ToolHash,
                warning_only,
                format!(
                    "Same tool and parameters called {} times in a row ({})",
                    tool_capacity, tool_name
                ),
                count,
            );
        }

        if !output.is_empty() {
            let content_hash = content_hash(output, self.config.content_prefix_chars);
            push_bounded(&mut state.content_hash_window, content_hash, content_capacity);
            if is_saturated(&state.content_hash_window, content_capacity) {
                return LoopVerdict::detected(
                    LoopType::ContentHash,
                    warning_only,
                    format!("Identical output {} times in a row", content_capacity),
                    count,
                );
            }
        }

        let max_turns = self.config.max_turns_for(&self.agent_type);
        if count > max_turns {
            return LoopVerdict::detected(
                LoopType::ExcessiveTurns,
                warning_only,
                format!(
                    "Session made {} tool calls, limit for '{}' is {}",
                    count, self.agent_type, max_turns
                ),
                count,
            );
        }

        LoopVerdict::clear("No loop detected", count)
    }
}

/// Signature of a tool call.
#[must_use]
pub fn tool_hash(tool_name: &str, params_summary: &str) -> String {
    short_digest(&format!("{}:{}", tool_name, params_summary))
}

/// Signature of the first `prefix_chars` characters of an output.
#[must_use]
pub fn content_hash(output: &str, prefix_chars: usize) -> String {
    let prefix: String = output.chars().take(prefix_chars).collect();
    short_digest(&prefix)
}

fn short_digest(text: &str) -> String {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    digest[..HASH_CHARS].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> LoopDetector {
        LoopDetector::new(LoopDetectorConfig::default()).unwrap()
    }

    // =========================================================================
    // Tool hash tier
    // =========================================================================

    #[test]
    fn test_four_identical_calls_are_not_a_loop() {
        let detector = detector();
        let mut state = LoopWindowState::default();
        for i in 0..4 {
            let verdict = detector.check(&mut state, "Bash", "curl api", &format!("out {i}"));
            assert!(!verdict.loop_detected, "call {} flagged", i + 1);
        }
    }

    #[test]
    fn test_fifth_identical_call_is_tool_hash_loop() {
        let detector = detector();
        let mut state = LoopWindowState::default();
        let verdicts: Vec<_> = (0..5)
            .map(|i| detector.check(&mut state, "Bash", "curl api", &format!("out {i}")))
            .collect();
        let last = verdicts.last().unwrap();
        assert!(last.loop_detected);
        assert_eq!(last.loop_type, Some(LoopType::ToolHash));
        assert!(last.warning_only);
        assert_eq!(last.session_call_count, 5);
    }

    #[test]
    fn test_interleaved_call_breaks_the_run() {
        let detector = detector();
        let mut state = LoopWindowState::default();
        for i in 0..4 {
            detector.check(&mut state, "Bash", "curl api", &format!("out {i}"));
        }
        detector.check(&mut state, "Bash", "ls", "listing");
        let verdict = detector.check(&mut state, "Bash", "curl api", "out 9");
        assert!(!verdict.loop_detected);
    }

    #[test]
    fn test_blocking_mode() {
        let config = LoopDetectorConfig {
            warning_mode: false,
            ..LoopDetectorConfig::default()
        };
        let detector = LoopDetector::new(config).unwrap();
        let mut state = LoopWindowState::default();
        let mut last = LoopVerdict::clear("", 0);
        for i in 0..5 {
            last = detector.check(&mut state, "Read", "/tmp/a.txt", &format!("{i}"));
        }
        assert!(last.should_block());
    }

    // =========================================================================
    // Content hash tier
    // =========================================================================

    #[test]
    fn test_identical_output_is_content_loop() {
        let detector = detector();
        let mut state = LoopWindowState::default();
        let mut last = LoopVerdict::clear("", 0);
        for i in 0..3 {
            last = detector.check(&mut state, "Bash", &format!("cmd {i}"), "same output");
        }
        assert_eq!(last.loop_type, Some(LoopType::ContentHash));
    }

    #[test]
    fn test_empty_output_skips_content_tier() {
        let detector = detector();
        let mut state = LoopWindowState::default();
        for i in 0..10 {
            let verdict = detector.check(&mut state, "Bash", &format!("cmd {i}"), "");
            assert!(!verdict.loop_detected);
        }
        assert!(state.content_hash_window.is_empty());
    }

    #[test]
    fn test_content_hash_uses_prefix_only() {
        let a = format!("{}tail-a", "x".repeat(500));
        let b = format!("{}tail-b", "x".repeat(500));
        assert_eq!(content_hash(&a, 500), content_hash(&b, 500));
        assert_ne!(content_hash(&a, 600), content_hash(&b, 600));
    }

    // =========================================================================
    // Excessive turns tier
    // =========================================================================

    #[test]
    fn test_excessive_turns_per_agent_type() {
        let detector = detector().with_agent_type("digest");
        let mut state = LoopWindowState {
            session_call_count: 80,
            ..LoopWindowState::default()
        };
        let verdict = detector.check(&mut state, "Bash", "unique", "unique output");
        assert_eq!(verdict.loop_type, Some(LoopType::ExcessiveTurns));
        assert!(verdict.reason.contains("digest"));
    }

    #[test]
    fn test_at_budget_is_not_excessive() {
        let detector = detector();
        let mut state = LoopWindowState {
            session_call_count: 119,
            ..LoopWindowState::default()
        };
        let verdict = detector.check(&mut state, "Bash", "unique", "unique output");
        assert!(!verdict.loop_detected);
        assert_eq!(verdict.session_call_count, 120);
    }

    // =========================================================================
    // Whitelist
    // =========================================================================

    #[test]
    fn test_whitelisted_paths_never_loop() {
        let detector = detector();
        let mut state = LoopWindowState::default();
        for _ in 0..300 {
            let verdict = detector.check(&mut state, "Read", "skills/SKILL_INDEX.md", "same");
            assert!(!verdict.loop_detected);
        }
        assert_eq!(state.session_call_count, 300);
        assert!(state.tool_hash_window.is_empty());
        assert!(state.content_hash_window.is_empty());
    }

    #[test]
    fn test_whitelist_patterns() {
        let detector = detector();
        assert!(detector.is_whitelisted("cache/todoist.json"));
        assert!(detector.is_whitelisted("context/digest-memory.json"));
        assert!(detector.is_whitelisted("state/scheduler-state.json"));
        assert!(detector.is_whitelisted("state/api-health.json"));
        assert!(detector.is_whitelisted("state/loop-state-3f2a9c1d.json"));
        assert!(!detector.is_whitelisted("state/loop-state-unknown.json"));
        assert!(!detector.is_whitelisted("src/main.rs"));
    }

    #[test]
    fn test_invalid_whitelist_pattern_is_config_error() {
        let config = LoopDetectorConfig {
            whitelist: vec!["([unclosed".to_string()],
            ..LoopDetectorConfig::default()
        };
        let err = LoopDetector::new(config).unwrap_err();
        assert!(err.is_config_error());
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    #[test]
    fn test_tool_hash_is_short_hex() {
        let hash = tool_hash("Bash", "ls");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, tool_hash("Read", "ls"));
    }

    #[test]
    fn test_oversized_persisted_window_is_trimmed() {
        let detector = detector();
        let hash = tool_hash("Bash", "same");
        let mut state = LoopWindowState {
            session_call_count: 3,
            tool_hash_window: vec![hash; 9].into(),
            ..LoopWindowState::default()
        };
        let verdict = detector.check(&mut state, "Bash", "same", "out");
        assert_eq!(verdict.loop_type, Some(LoopType::ToolHash));
        assert_eq!(state.tool_hash_window.len(), 5);
    }
}

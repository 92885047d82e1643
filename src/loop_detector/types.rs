//! Core types for loop detection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Which detection tier fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// Same tool with the same parameters, back to back.
    ToolHash,
    /// Same output, back to back.
    ContentHash,
    /// The session made more calls than its agent type allows.
    ExcessiveTurns,
}

impl std::fmt::Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolHash => write!(f, "tool_hash"),
            Self::ContentHash => write!(f, "content_hash"),
            Self::ExcessiveTurns => write!(f, "excessive_turns"),
        }
    }
}

/// Result of checking one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopVerdict {
    pub loop_detected: bool,
    pub loop_type: Option<LoopType>,
    /// True when a detected loop is advisory only.
    pub warning_only: bool,
    pub reason: String,
    /// Session call count after this call.
    pub session_call_count: u64,
}

impl LoopVerdict {
    pub(crate) fn clear(reason: impl Into<String>, session_call_count: u64) -> Self {
        Self {
            loop_detected: false,
            loop_type: None,
            warning_only: false,
            reason: reason.into(),
            session_call_count,
        }
    }

    pub(crate) fn detected(
        loop_type: LoopType,
        warning_only: bool,
        reason: impl Into<String>,
        session_call_count: u64,
    ) -> Self {
        Self {
            loop_detected: true,
            loop_type: Some(loop_type),
            warning_only,
            reason: reason.into(),
            session_call_count,
        }
    }

    /// Returns true if the call should be stopped.
    #[must_use]
    pub fn should_block(&self) -> bool {
        self.loop_detected && !self.warning_only
    }
}

/// Persisted per-session detector memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopWindowState {
    #[serde(default)]
    pub session_call_count: u64,
    #[serde(default)]
    pub tool_hash_window: VecDeque<String>,
    #[serde(default)]
    pub content_hash_window: VecDeque<String>,
}

impl LoopWindowState {
    /// Drop the oldest entries until both windows fit their capacity.
    pub fn truncate_to(&mut self, tool_capacity: usize, content_capacity: usize) {
        trim_front(&mut self.tool_hash_window, tool_capacity);
        trim_front(&mut self.content_hash_window, content_capacity);
    }
}

/// Append to a bounded FIFO, evicting the oldest entry on overflow.
pub(crate) fn push_bounded(window: &mut VecDeque<String>, value: String, capacity: usize) {
    window.push_back(value);
    trim_front(window, capacity);
}

fn trim_front(window: &mut VecDeque<String>, capacity: usize) {
    while window.len() > capacity {
        window.pop_front();
    }
}

/// Returns true if the window is full and every entry is identical.
pub(crate) fn is_saturated(window: &VecDeque<String>, capacity: usize) -> bool {
    window.len() == capacity && window.iter().all(|h| Some(h) == window.front())
}

/// Loop detection settings (the `loop_detection` section of
/// `config/timeouts.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDetectorConfig {
    /// Tool-hash window capacity (default: 5).
    #[serde(default = "default_tool_hash_threshold")]
    pub tool_hash_threshold: usize,

    /// Content-hash window capacity (default: 3).
    #[serde(default = "default_content_threshold")]
    pub content_threshold: usize,

    /// Characters of output hashed for the content tier (default: 500).
    #[serde(default = "default_content_prefix_chars")]
    pub content_prefix_chars: usize,

    /// Call budget per agent type; the `default` entry covers the rest.
    #[serde(default = "default_max_turns")]
    pub max_turns: BTreeMap<String, u64>,

    /// Report loops without blocking (default: true).
    #[serde(default = "default_warning_mode")]
    pub warning_mode: bool,

    /// Parameter patterns that are legitimately repeated.
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

/// Fallback call budget when `max_turns` has no `default` entry.
pub const DEFAULT_MAX_TURNS: u64 = 120;

fn default_tool_hash_threshold() -> usize {
    5
}

fn default_content_threshold() -> usize {
    3
}

fn default_content_prefix_chars() -> usize {
    500
}

fn default_max_turns() -> BTreeMap<String, u64> {
    [
        ("digest", 80),
        ("todoist", 150),
        ("research", 100),
        ("audit", 120),
        ("default", DEFAULT_MAX_TURNS),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_warning_mode() -> bool {
    true
}

fn default_whitelist() -> Vec<String> {
    [
        r"SKILL_INDEX\.md$",
        r"cache/.*\.json$",
        r"digest-memory\.json$",
        r"scheduler-state\.json$",
        r"api-health\.json$",
        r"state/loop-state-[0-9a-f]{8}\.json$",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            tool_hash_threshold: default_tool_hash_threshold(),
            content_threshold: default_content_threshold(),
            content_prefix_chars: default_content_prefix_chars(),
            max_turns: default_max_turns(),
            warning_mode: default_warning_mode(),
            whitelist: default_whitelist(),
        }
    }
}

impl LoopDetectorConfig {
    /// Call budget for an agent type.
    #[must_use]
    pub fn max_turns_for(&self, agent_type: &str) -> u64 {
        self.max_turns
            .get(agent_type)
            .or_else(|| self.max_turns.get("default"))
            .copied()
            .unwrap_or(DEFAULT_MAX_TURNS)
    }

    /// Tool window capacity, at least 1.
    #[must_use]
    pub fn tool_capacity(&self) -> usize {
        self.tool_hash_threshold.max(1)
    }

    /// Content window capacity, at least 1.
    #[must_use]
    pub fn content_capacity(&self) -> usize {
        self.content_threshold.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_evicts_oldest() {
        let mut window = VecDeque::new();
        for i in 0..5 {
            push_bounded(&mut window, i.to_string(), 3);
        }
        assert_eq!(window, VecDeque::from(vec!["2".to_string(), "3".into(), "4".into()]));
    }

    #[test]
    fn test_is_saturated() {
        let same: VecDeque<String> = vec!["a".to_string(); 3].into();
        let mixed: VecDeque<String> = vec!["a".to_string(), "b".into(), "a".into()].into();
        assert!(is_saturated(&same, 3));
        assert!(!is_saturated(&same, 4));
        assert!(!is_saturated(&mixed, 3));
    }

    #[test]
    fn test_max_turns_for() {
        let config = LoopDetectorConfig::default();
        assert_eq!(config.max_turns_for("digest"), 80);
        assert_eq!(config.max_turns_for("todoist"), 150);
        assert_eq!(config.max_turns_for("something-else"), 120);

        let bare = LoopDetectorConfig {
            max_turns: BTreeMap::new(),
            ..LoopDetectorConfig::default()
        };
        assert_eq!(bare.max_turns_for("digest"), DEFAULT_MAX_TURNS);
    }

    #[test]
    fn test_config_accepts_unknown_window_keys() {
        let yaml = r#"
tool_hash_threshold: 4
tool_hash_window: 20
content_window: 10
max_turns:
  digest: 60
  default: 90
"#;
        let config: LoopDetectorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tool_hash_threshold, 4);
        assert_eq!(config.content_threshold, 3);
        assert_eq!(config.max_turns_for("digest"), 60);
        assert_eq!(config.max_turns_for("audit"), 90);
        assert!(config.warning_mode);
    }

    #[test]
    fn test_state_truncate_to() {
        let mut state = LoopWindowState {
            session_call_count: 9,
            tool_hash_window: (0..8).map(|i| i.to_string()).collect(),
            content_hash_window: (0..2).map(|i| i.to_string()).collect(),
        };
        state.truncate_to(5, 3);
        assert_eq!(state.tool_hash_window.len(), 5);
        assert_eq!(state.tool_hash_window.front().map(String::as_str), Some("3"));
        assert_eq!(state.content_hash_window.len(), 2);
    }

    #[test]
    fn test_verdict_should_block() {
        assert!(!LoopVerdict::clear("ok", 1).should_block());
        assert!(!LoopVerdict::detected(LoopType::ToolHash, true, "x", 5).should_block());
        assert!(LoopVerdict::detected(LoopType::ToolHash, false, "x", 5).should_block());
    }
}

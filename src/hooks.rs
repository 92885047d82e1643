//! Hook entry points for the host agent.
//!
//! Each hook reads one JSON object describing a tool call and answers with a
//! [`HookOutput`]. Hooks fail open: malformed input, unreadable state or a
//! broken rule file all produce `allow`, so a bug in this layer never stops
//! the agent's normal tool use.
//!
//! | Hook | Runs | Does |
//! |------|------|------|
//! | `pre-bash` | before a shell command | policy check, then open-circuit check |
//! | `pre-write` | before a file write | policy check |
//! | `pre-read` | before a file read | policy check |
//! | `post-tool` | after any tool call | breaker bookkeeping, loop detection |

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::loop_detector::LoopTracker;
use crate::policy::PolicyDecision;

/// Version of the hook response format.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Shell commands are summarized to this many characters for loop hashing.
pub const COMMAND_SUMMARY_CHARS: usize = 200;

/// Guard tag used when a call is refused because its API circuit is open.
pub const CIRCUIT_GUARD_TAG: &str = "circuit-guard";

/// Types of hooks that can be run.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum HookKind {
    /// Before a shell command runs
    PreBash,
    /// Before a file is written
    PreWrite,
    /// Before a file is read
    PreRead,
    /// After any tool call completes
    PostTool,
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PreBash => "pre-bash",
            Self::PreWrite => "pre-write",
            Self::PreRead => "pre-read",
            Self::PostTool => "post-tool",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// One tool call, as sent by the host agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub session_id: String,
    /// Tool result; only present for post-tool calls.
    #[serde(default, alias = "tool_output")]
    pub tool_response: Option<Value>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl HookInput {
    /// Parse hook input from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::HookInput`] if the text is not a JSON object.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| WardenError::hook_input(e.to_string()))
    }

    fn input_str(&self, field: &str) -> Option<&str> {
        self.tool_input
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Shell command, for `Bash` calls.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.input_str("command")
    }

    /// Target file, for read/write/edit calls.
    #[must_use]
    pub fn file_path(&self) -> Option<&str> {
        self.input_str("file_path")
            .or_else(|| self.input_str("notebook_path"))
            .or_else(|| self.input_str("path"))
    }

    /// Short, stable description of the call's parameters.
    ///
    /// Shell commands are cut to [`COMMAND_SUMMARY_CHARS`] characters; file
    /// tools use their path; anything else is the compact JSON input.
    #[must_use]
    pub fn params_summary(&self) -> String {
        if let Some(command) = self.command() {
            return command.chars().take(COMMAND_SUMMARY_CHARS).collect();
        }
        if let Some(path) = self.file_path() {
            return path.to_string();
        }
        match &self.tool_input {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Tool output as text. Shell results are `stdout` followed by `stderr`.
    #[must_use]
    pub fn output_text(&self) -> String {
        match &self.tool_response {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(value @ Value::Object(map)) => {
                let streams: Vec<&str> = ["stdout", "stderr", "output"]
                    .iter()
                    .filter_map(|key| map.get(*key).and_then(Value::as_str))
                    .filter(|s| !s.is_empty())
                    .collect();
                if streams.is_empty() {
                    value.to_string()
                } else {
                    streams.join("\n")
                }
            }
            Some(other) => other.to_string(),
        }
    }

    /// Exit status of the call, from `exit_code` or the tool response.
    #[must_use]
    pub fn effective_exit_code(&self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        self.tool_response
            .as_ref()
            .and_then(|r| r.get("exit_code").or_else(|| r.get("returncode")))
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(0)
    }

    /// Session id prefix used in logs.
    #[must_use]
    pub fn session_prefix(&self) -> &str {
        match self.session_id.char_indices().nth(12) {
            Some((idx, _)) => &self.session_id[..idx],
            None => &self.session_id,
        }
    }
}

/// Allow or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

/// Hook response written to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutput {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub protocol_version: String,
    pub timestamp: DateTime<Utc>,
}

impl HookOutput {
    fn new(decision: Decision, reason: Option<String>) -> Self {
        Self {
            decision,
            reason,
            protocol_version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Plain `allow`.
    #[must_use]
    pub fn allow() -> Self {
        Self::new(Decision::Allow, None)
    }

    /// `allow` carrying an advisory message.
    pub fn allow_with(reason: impl Into<String>) -> Self {
        Self::new(Decision::Allow, Some(reason.into()))
    }

    /// `block` with the reason shown to the agent.
    pub fn block(reason: impl Into<String>) -> Self {
        Self::new(Decision::Block, Some(reason.into()))
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.decision == Decision::Block
    }

    /// Serialize to a single JSON line.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"decision":"allow","protocol_version":"{}"}}"#,
                PROTOCOL_VERSION
            )
        })
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run a hook on raw stdin text. Never fails.
pub fn run_hook(kind: HookKind, raw: &str, config: &WardenConfig) -> HookOutput {
    let input = match HookInput::parse(raw) {
        Ok(input) => input,
        Err(e) => {
            warn!(hook = %kind, "Allowing call with unreadable hook input: {}", e);
            return HookOutput::allow();
        }
    };
    match kind {
        HookKind::PreBash => pre_bash(&input, config),
        HookKind::PreWrite => pre_write(&input, config),
        HookKind::PreRead => pre_read(&input, config),
        HookKind::PostTool => post_tool(&input, config),
    }
}

fn log_block(input: &HookInput, config: &WardenConfig, rule_id: &str, guard_tag: &str, reason: &str) {
    warn!(
        guard_tag,
        rule_id,
        tool = %input.tool_name,
        session = input.session_prefix(),
        trace_id = config.trace_id.as_deref().unwrap_or(""),
        phase = config.phase.as_deref().unwrap_or(""),
        "Blocked: {}",
        reason
    );
}

fn decision_output(decision: PolicyDecision, input: &HookInput, config: &WardenConfig) -> HookOutput {
    match decision {
        PolicyDecision::Allow => HookOutput::allow(),
        PolicyDecision::Block {
            rule_id,
            reason,
            guard_tag,
        } => {
            log_block(input, config, &rule_id, &guard_tag, &reason);
            HookOutput::block(reason)
        }
    }
}

/// Policy check for shell commands, then a circuit check for commands that
/// talk to a known API source.
pub fn pre_bash(input: &HookInput, config: &WardenConfig) -> HookOutput {
    let Some(command) = input.command() else {
        return HookOutput::allow();
    };

    let decision = config.policy_engine().check_bash_command(command);
    if decision.is_blocked() {
        return decision_output(decision, input, config);
    }

    let Some(source) = config.error_classifier().detect_api_source(command) else {
        return HookOutput::allow();
    };
    let breaker = CircuitBreaker::new(config.state_store(), config.breaker.clone());
    match breaker.check_health(&source) {
        Ok(check) if !check.allowed => {
            let until = check
                .cooldown_until
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            let reason = format!(
                "API source '{}' is unavailable (circuit {}, retry after {}); use cached data",
                source, check.state, until
            );
            log_block(input, config, "circuit-open", CIRCUIT_GUARD_TAG, &reason);
            HookOutput::block(reason)
        }
        Ok(check) => {
            if check.transitioned {
                debug!(source = %source, "Circuit half-open, allowing probe");
            }
            HookOutput::allow()
        }
        Err(e) => {
            warn!(source = %source, "Health check failed, allowing: {}", e);
            HookOutput::allow()
        }
    }
}

/// Policy check for file writes.
pub fn pre_write(input: &HookInput, config: &WardenConfig) -> HookOutput {
    match input.file_path() {
        Some(path) => decision_output(config.policy_engine().check_write_path(path), input, config),
        None => HookOutput::allow(),
    }
}

/// Policy check for file reads.
pub fn pre_read(input: &HookInput, config: &WardenConfig) -> HookOutput {
    match input.file_path() {
        Some(path) => decision_output(config.policy_engine().check_read_path(path), input, config),
        None => HookOutput::allow(),
    }
}

/// Bookkeeping after a tool call: breaker signals for shell calls to known
/// API sources, then loop detection for every call.
///
/// Allows unless a loop is detected with warning mode off.
pub fn post_tool(input: &HookInput, config: &WardenConfig) -> HookOutput {
    let output = input.output_text();

    if input.tool_name == "Bash" {
        if let Some(command) = input.command() {
            record_api_outcome(command, &output, input.effective_exit_code(), config);
        }
    }

    let detector = match config.loop_detector() {
        Ok(detector) => detector,
        Err(e) => {
            warn!("Loop detection disabled: {}", e);
            return HookOutput::allow();
        }
    };
    let tracker = LoopTracker::new(config.state_store(), detector);
    let verdict = match tracker.record(
        &input.session_id,
        &input.tool_name,
        &input.params_summary(),
        &output,
    ) {
        Ok(updated) => updated.value,
        Err(e) => {
            warn!("Loop state unavailable, assuming no loop: {}", e);
            return HookOutput::allow();
        }
    };

    if !verdict.loop_detected {
        return HookOutput::allow();
    }
    let kind = verdict
        .loop_type
        .map(|t| t.to_string())
        .unwrap_or_else(|| "loop".to_string());
    let reason = format!("Loop detected ({}): {}", kind, verdict.reason);
    if verdict.should_block() {
        log_block(input, config, &kind, "loop-guard", &reason);
        HookOutput::block(reason)
    } else {
        HookOutput::allow_with(reason)
    }
}

fn record_api_outcome(command: &str, output: &str, exit_code: i32, config: &WardenConfig) {
    let classification = config.error_classifier().classify(command, output, exit_code);
    if classification.api_source.is_none() {
        return;
    }
    debug!(
        source = classification.api_source.as_deref().unwrap_or(""),
        category = %classification.category,
        "Classified API call"
    );
    let breaker = CircuitBreaker::new(config.state_store(), config.breaker.clone());
    if let Err(e) = breaker.record_classification(&classification) {
        warn!("Could not record API health: {}", e);
    }
}

//! Error classification for tool output.
//!
//! Maps the raw output of a command (usually a `curl` call against one of the
//! agent's API sources) to a small retry taxonomy.
//!
//! # Architecture
//!
//! ```text
//! (command, output, exit_code) ──classify──> ErrorClassification
//!                                               │
//!                        ┌──────────────────────┼──────────────────┐
//!                        ▼                      ▼                  ▼
//!                  breaker_signal()     retry_delay(attempt)   should_alert
//!                  (CircuitBreaker)      (caller's retry loop)  (alerting)
//! ```
//!
//! Classification is a pure function over its inputs and the
//! [`ClassifierConfig`]. Regexes are compiled once, when the
//! [`ErrorClassifier`] is built.

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Only the head of the output is scanned for status codes.
const STATUS_SCAN_CHARS: usize = 5000;

// ============================================================================
// Taxonomy
// ============================================================================

/// Broad class of a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Exit code 0.
    Success,
    /// HTTP 429.
    RateLimit,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx, most importantly 401/403.
    ClientError,
    /// Connection refused, DNS failure, timeout.
    NetworkError,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// How this category feeds the circuit breaker.
    ///
    /// Rate limits heal on their own and auth failures are not an availability
    /// problem, so neither counts against the source.
    #[must_use]
    pub fn breaker_signal(&self) -> Option<CallOutcome> {
        match self {
            Self::Success => Some(CallOutcome::Success),
            Self::ServerError | Self::NetworkError => Some(CallOutcome::Failure),
            Self::RateLimit | Self::ClientError | Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryIntent {
    /// Nothing to retry.
    None,
    /// Retry once, right away.
    Immediate,
    /// Retry with `wait_seconds * multiplier^attempt`.
    Exponential,
    /// Wait `wait_seconds` before the next attempt.
    LongDelay,
    /// Do not retry; serve cached data instead.
    UseCache,
    /// Do not retry at all.
    Stop,
}

impl std::fmt::Display for RetryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Immediate => "immediate",
            Self::Exponential => "exponential",
            Self::LongDelay => "long_delay",
            Self::UseCache => "use_cache",
            Self::Stop => "stop",
        };
        write!(f, "{}", s)
    }
}

/// Success/failure signal consumed by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Result of classifying one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retry_intent: RetryIntent,
    /// Wait hint in seconds. For [`RetryIntent::Exponential`] this is the base.
    pub wait_seconds: u64,
    pub should_alert: bool,
    pub api_source: Option<String>,
    pub http_status: Option<u16>,
    pub details: String,
}

impl ErrorClassification {
    /// Delay before retry number `attempt` (0-indexed), or `None` when the
    /// caller should not retry any more.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32, backoff: &BackoffPolicy) -> Option<Duration> {
        match self.retry_intent {
            RetryIntent::None | RetryIntent::UseCache | RetryIntent::Stop => None,
            RetryIntent::Immediate => (attempt == 0).then_some(Duration::ZERO),
            RetryIntent::LongDelay => {
                (attempt < backoff.max_attempts).then(|| Duration::from_secs(self.wait_seconds))
            }
            RetryIntent::Exponential => backoff.delay_for(self.wait_seconds, attempt),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Exponential back-off limits applied by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_multiplier")]
    pub multiplier: u64,
    #[serde(default = "default_max_seconds")]
    pub max_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_multiplier() -> u64 {
    2
}

fn default_max_seconds() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            max_seconds: default_max_seconds(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffPolicy {
    /// `base_seconds * multiplier^attempt`, capped at `max_seconds`.
    ///
    /// Returns `None` once `attempt` reaches `max_attempts`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use warden::classifier::BackoffPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = BackoffPolicy::default();
    /// assert_eq!(policy.delay_for(5, 0), Some(Duration::from_secs(5)));
    /// assert_eq!(policy.delay_for(5, 2), Some(Duration::from_secs(20)));
    /// assert_eq!(policy.delay_for(5, 3), None);
    /// ```
    #[must_use]
    pub fn delay_for(&self, base_seconds: u64, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt);
        let delay = base_seconds.saturating_mul(factor).min(self.max_seconds);
        Some(Duration::from_secs(delay))
    }
}

/// Mapping for one CLI exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeRule {
    pub category: ErrorCategory,
    pub intent: RetryIntent,
}

/// Substrings identifying one API source in a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSourcePattern {
    pub source: String,
    pub patterns: Vec<String>,
}

impl ApiSourcePattern {
    fn new(source: &str, patterns: &[&str]) -> Self {
        Self {
            source: source.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Classifier settings, normally read from `config/error-patterns.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Wait for a 429 without a `Retry-After` header (default: 60).
    #[serde(default = "default_rate_limit_wait")]
    pub rate_limit_default_wait: u64,

    /// Base wait for network errors, before back-off (default: 5).
    #[serde(default = "default_network_base_wait")]
    pub network_base_wait: u64,

    /// Base wait for exit codes mapped to exponential retry (default: 10).
    #[serde(default = "default_exit_code_base_wait")]
    pub exit_code_base_wait: u64,

    /// Exit-code table consulted when nothing else matched.
    #[serde(default = "default_exit_codes")]
    pub exit_codes: BTreeMap<i32, ExitCodeRule>,

    /// Lowercase substrings that mark a connection, timeout or DNS failure.
    #[serde(default = "default_network_keywords")]
    pub network_keywords: Vec<String>,

    /// Ordered source table; the first match wins.
    #[serde(default = "default_api_sources")]
    pub api_sources: Vec<ApiSourcePattern>,

    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_rate_limit_wait() -> u64 {
    60
}

fn default_network_base_wait() -> u64 {
    5
}

fn default_exit_code_base_wait() -> u64 {
    10
}

fn default_exit_codes() -> BTreeMap<i32, ExitCodeRule> {
    let killed = ExitCodeRule {
        category: ErrorCategory::Unknown,
        intent: RetryIntent::Exponential,
    };
    // 137 = SIGKILL (often OOM), 143 = SIGTERM
    [(137, killed), (143, killed)].into_iter().collect()
}

fn default_network_keywords() -> Vec<String> {
    [
        "connection refused",
        "connection timed out",
        "connection reset",
        "network unreachable",
        "network is unreachable",
        "timeout",
        "timed out",
        "name or service not known",
        "temporary failure in name resolution",
        "could not resolve host",
        "econnrefused",
        "econnreset",
        "etimedout",
        "enotfound",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Built-in API source table.
#[must_use]
pub fn default_api_sources() -> Vec<ApiSourcePattern> {
    vec![
        ApiSourcePattern::new("todoist", &["todoist.com", "todoist"]),
        ApiSourcePattern::new("pingtung-news", &["ptnews-mcp", "pingtung"]),
        ApiSourcePattern::new("hackernews", &["hacker-news.firebaseio", "hn.algolia"]),
        ApiSourcePattern::new("knowledge", &["localhost:3000"]),
        ApiSourcePattern::new("ntfy", &["ntfy.sh"]),
        ApiSourcePattern::new("gmail", &["gmail.googleapis"]),
    ]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rate_limit_default_wait: default_rate_limit_wait(),
            network_base_wait: default_network_base_wait(),
            exit_code_base_wait: default_exit_code_base_wait(),
            exit_codes: default_exit_codes(),
            network_keywords: default_network_keywords(),
            api_sources: default_api_sources(),
            backoff: BackoffPolicy::default(),
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Classifies tool output into an [`ErrorClassification`].
///
/// # Example
///
/// ```rust
/// use warden::classifier::{ErrorCategory, ErrorClassifier, RetryIntent};
///
/// let classifier = ErrorClassifier::new();
/// let result = classifier.classify(
///     "curl https://api.todoist.com/rest/v2/tasks",
///     "HTTP/1.1 429 Too Many Requests\nRetry-After: 30",
///     22,
/// );
/// assert_eq!(result.category, ErrorCategory::RateLimit);
/// assert_eq!(result.retry_intent, RetryIntent::LongDelay);
/// assert_eq!(result.wait_seconds, 30);
/// ```
pub struct ErrorClassifier {
    config: ClassifierConfig,
    status_patterns: Vec<Regex>,
    retry_after: Option<Regex>,
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Create a classifier with the built-in configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClassifierConfig::default())
    }

    /// Create a classifier with a custom configuration.
    #[must_use]
    pub fn with_config(config: ClassifierConfig) -> Self {
        // Static patterns; failing to compile would be a programming error.
        let status_patterns = [
            r"(?i)HTTP/\d(?:\.\d)?\s+(\d{3})\b",
            r"(?i)\bstatus:\s*(\d{3})\b",
            r"(?i)\berror\s+(\d{3})\b",
            r#"(?i)"status"\s*:\s*(\d{3})\b"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        let retry_after = Regex::new(r"(?i)Retry-After:\s*(\d+)").ok();

        Self {
            config,
            status_patterns,
            retry_after,
        }
    }

    /// Get the active configuration.
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify one tool call.
    #[must_use]
    pub fn classify(&self, command: &str, output: &str, exit_code: i32) -> ErrorClassification {
        let api_source = self.detect_api_source(command);

        if exit_code == 0 {
            return ErrorClassification {
                category: ErrorCategory::Success,
                retry_intent: RetryIntent::None,
                wait_seconds: 0,
                should_alert: false,
                api_source,
                http_status: None,
                details: "Command executed successfully".to_string(),
            };
        }

        let http_status = self.extract_http_status(output);

        if let Some(status) = http_status {
            if let Some(result) = self.classify_status(status, output, api_source.clone()) {
                return result;
            }
        }

        if self.is_network_error(output) {
            return ErrorClassification {
                category: ErrorCategory::NetworkError,
                retry_intent: RetryIntent::Exponential,
                wait_seconds: self.config.network_base_wait,
                should_alert: true,
                api_source,
                http_status,
                details: "Connection error, use exponential backoff".to_string(),
            };
        }

        if let Some(rule) = self.config.exit_codes.get(&exit_code) {
            let wait_seconds = match rule.intent {
                RetryIntent::Exponential | RetryIntent::LongDelay => {
                    self.config.exit_code_base_wait
                }
                _ => 0,
            };
            return ErrorClassification {
                category: rule.category,
                retry_intent: rule.intent,
                wait_seconds,
                should_alert: rule.intent == RetryIntent::Stop,
                api_source,
                http_status,
                details: format!("Exit code {} mapped to {}", exit_code, rule.intent),
            };
        }

        ErrorClassification {
            category: ErrorCategory::Unknown,
            retry_intent: RetryIntent::Immediate,
            wait_seconds: 0,
            should_alert: false,
            api_source,
            http_status,
            details: format!("Unknown error (exit code {}), retry once", exit_code),
        }
    }

    fn classify_status(
        &self,
        status: u16,
        output: &str,
        api_source: Option<String>,
    ) -> Option<ErrorClassification> {
        let (category, retry_intent, wait_seconds, should_alert, details) = match status {
            429 => {
                let wait = self
                    .extract_retry_after(output)
                    .unwrap_or(self.config.rate_limit_default_wait);
                (
                    ErrorCategory::RateLimit,
                    RetryIntent::LongDelay,
                    wait,
                    false,
                    format!("Rate limit hit, retry after {}s", wait),
                )
            }
            500..=599 => (
                ErrorCategory::ServerError,
                RetryIntent::UseCache,
                0,
                true,
                format!("Server error {}, use cache fallback", status),
            ),
            401 | 403 => (
                ErrorCategory::ClientError,
                RetryIntent::Stop,
                0,
                true,
                format!("Auth error {}, credentials may be invalid", status),
            ),
            400..=499 => (
                ErrorCategory::ClientError,
                RetryIntent::Stop,
                0,
                false,
                format!("Client error {}, retrying will not help", status),
            ),
            _ => return None,
        };

        Some(ErrorClassification {
            category,
            retry_intent,
            wait_seconds,
            should_alert,
            api_source,
            http_status: Some(status),
            details,
        })
    }

    /// Extract the HTTP status code that appears last in the head of `output`.
    #[must_use]
    pub fn extract_http_status(&self, output: &str) -> Option<u16> {
        let head = scan_window(output);
        self.status_patterns
            .iter()
            .flat_map(|re| re.captures_iter(head))
            .filter_map(|caps| {
                let m = caps.get(1)?;
                let status = m.as_str().parse::<u16>().ok()?;
                Some((m.start(), status))
            })
            .max_by_key(|(pos, _)| *pos)
            .map(|(_, status)| status)
    }

    /// Extract a `Retry-After: N` header value in seconds.
    #[must_use]
    pub fn extract_retry_after(&self, output: &str) -> Option<u64> {
        self.retry_after
            .as_ref()?
            .captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn is_network_error(&self, output: &str) -> bool {
        let lower = scan_window(output).to_lowercase();
        self.config
            .network_keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
    }

    /// Detect which API source a command talks to.
    #[must_use]
    pub fn detect_api_source(&self, command: &str) -> Option<String> {
        let lower = command.to_lowercase();
        self.config
            .api_sources
            .iter()
            .find(|entry| entry.patterns.iter().any(|p| lower.contains(&p.to_lowercase())))
            .map(|entry| entry.source.clone())
    }
}

/// The first [`STATUS_SCAN_CHARS`] characters of `text`.
fn scan_window(text: &str) -> &str {
    match text.char_indices().nth(STATUS_SCAN_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(command: &str, output: &str, exit_code: i32) -> ErrorClassification {
        ErrorClassifier::new().classify(command, output, exit_code)
    }

    // =========================================================================
    // Success
    // =========================================================================

    #[test]
    fn test_success_exit_code_zero() {
        let result = classify("curl https://api.todoist.com", "HTTP/1.1 500 oops", 0);
        assert_eq!(result.category, ErrorCategory::Success);
        assert_eq!(result.retry_intent, RetryIntent::None);
        assert!(!result.should_alert);
        assert_eq!(result.api_source.as_deref(), Some("todoist"));
    }

    // =========================================================================
    // Rate limit
    // =========================================================================

    #[test]
    fn test_rate_limit_with_retry_after() {
        let result = classify(
            "curl https://api.todoist.com",
            "HTTP/1.1 429 Too Many Requests\nRetry-After: 30",
            22,
        );
        assert_eq!(result.category, ErrorCategory::RateLimit);
        assert_eq!(result.retry_intent, RetryIntent::LongDelay);
        assert_eq!(result.wait_seconds, 30);
        assert!(!result.should_alert);
        assert_eq!(result.http_status, Some(429));
    }

    #[test]
    fn test_rate_limit_without_retry_after_uses_default() {
        let result = classify("curl todoist", "HTTP/1.1 429 Too Many Requests\n", 22);
        assert_eq!(result.category, ErrorCategory::RateLimit);
        assert_eq!(result.wait_seconds, 60);
    }

    #[test]
    fn test_rate_limit_status_colon_form() {
        let result = classify("curl todoist", "status: 429, message: Rate limit exceeded", 1);
        assert_eq!(result.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn test_rate_limit_json_status_field() {
        let result = classify("curl todoist", r#"{"error": "slow down", "status": 429}"#, 1);
        assert_eq!(result.category, ErrorCategory::RateLimit);
    }

    // =========================================================================
    // Server errors
    // =========================================================================

    #[test]
    fn test_server_error_500() {
        let result = classify("curl pingtung", "HTTP/1.1 500 Internal Server Error\n", 22);
        assert_eq!(result.category, ErrorCategory::ServerError);
        assert_eq!(result.retry_intent, RetryIntent::UseCache);
        assert!(result.should_alert);
        assert_eq!(result.api_source.as_deref(), Some("pingtung-news"));
    }

    #[test]
    fn test_server_error_error_prefix_form() {
        let result = classify("curl https://example.com", "Error 503: Service Unavailable", 1);
        assert_eq!(result.category, ErrorCategory::ServerError);
        assert_eq!(result.http_status, Some(503));
    }

    #[test]
    fn test_server_error_504_gateway_timeout_is_not_network() {
        let result = classify("curl api", "HTTP/1.1 504 Gateway Timeout", 22);
        assert_eq!(result.category, ErrorCategory::ServerError);
    }

    // =========================================================================
    // Client errors
    // =========================================================================

    #[test]
    fn test_client_error_401() {
        let result = classify("curl todoist", "HTTP/1.1 401 Unauthorized\n", 22);
        assert_eq!(result.category, ErrorCategory::ClientError);
        assert_eq!(result.retry_intent, RetryIntent::Stop);
        assert!(result.should_alert);
        assert_eq!(result.api_source.as_deref(), Some("todoist"));
    }

    #[test]
    fn test_client_error_403_gmail() {
        let result = classify(
            "curl https://gmail.googleapis.com/api",
            "status: 403 Forbidden",
            1,
        );
        assert_eq!(result.category, ErrorCategory::ClientError);
        assert_eq!(result.retry_intent, RetryIntent::Stop);
        assert_eq!(result.api_source.as_deref(), Some("gmail"));
    }

    #[test]
    fn test_client_error_404_does_not_alert() {
        let result = classify("curl api", "HTTP/1.1 404 Not Found", 22);
        assert_eq!(result.category, ErrorCategory::ClientError);
        assert_eq!(result.retry_intent, RetryIntent::Stop);
        assert!(!result.should_alert);
    }

    // =========================================================================
    // Status extraction
    // =========================================================================

    #[test]
    fn test_redirect_chain_prefers_last_status() {
        let output = "HTTP/1.1 301 Moved Permanently\nLocation: /v2\n\nHTTP/1.1 503 Service Unavailable";
        let result = classify("curl -L api", output, 22);
        assert_eq!(result.http_status, Some(503));
        assert_eq!(result.category, ErrorCategory::ServerError);
    }

    #[test]
    fn test_last_status_wins_across_pattern_kinds() {
        let classifier = ErrorClassifier::new();
        let output = "status: 500\nretrying...\nHTTP/2 429";
        assert_eq!(classifier.extract_http_status(output), Some(429));
    }

    #[test]
    fn test_status_beyond_scan_window_is_ignored() {
        let classifier = ErrorClassifier::new();
        let output = format!("{}HTTP/1.1 500", "x".repeat(STATUS_SCAN_CHARS));
        assert_eq!(classifier.extract_http_status(&output), None);
    }

    #[test]
    fn test_scan_window_respects_char_boundaries() {
        let text = "錯".repeat(STATUS_SCAN_CHARS + 10);
        assert_eq!(scan_window(&text).chars().count(), STATUS_SCAN_CHARS);
    }

    // =========================================================================
    // Network errors
    // =========================================================================

    #[test]
    fn test_network_error_connection_refused() {
        let result = classify(
            "curl localhost:3000",
            "curl: (7) Failed to connect to localhost port 3000: Connection refused",
            7,
        );
        assert_eq!(result.category, ErrorCategory::NetworkError);
        assert_eq!(result.retry_intent, RetryIntent::Exponential);
        assert_eq!(result.wait_seconds, 5);
        assert_eq!(result.api_source.as_deref(), Some("knowledge"));
    }

    #[test]
    fn test_network_error_timeout() {
        let result = classify(
            "curl api",
            "curl: (28) Connection timed out after 10000 milliseconds",
            28,
        );
        assert_eq!(result.category, ErrorCategory::NetworkError);
    }

    #[test]
    fn test_network_error_dns() {
        let result = classify(
            "curl invalid.example.com",
            "curl: (6) Could not resolve host: invalid.example.com",
            6,
        );
        assert_eq!(result.category, ErrorCategory::NetworkError);
    }

    // =========================================================================
    // Exit codes and unknown
    // =========================================================================

    #[test]
    fn test_exit_code_137_is_transient() {
        let result = classify("python big_job.py", "Killed", 137);
        assert_eq!(result.category, ErrorCategory::Unknown);
        assert_eq!(result.retry_intent, RetryIntent::Exponential);
        assert_eq!(result.wait_seconds, 10);
    }

    #[test]
    fn test_unknown_error_retries_once() {
        let result = classify("unknown command", "Some unknown error occurred", 127);
        assert_eq!(result.category, ErrorCategory::Unknown);
        assert_eq!(result.retry_intent, RetryIntent::Immediate);
        assert!(result.api_source.is_none());
    }

    // =========================================================================
    // API source detection
    // =========================================================================

    #[test]
    fn test_api_source_detection() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.detect_api_source("curl https://hacker-news.firebaseio.com/v0/topstories.json"),
            Some("hackernews".to_string())
        );
        assert_eq!(
            classifier.detect_api_source("curl -d @msg.json ntfy.sh/topic"),
            Some("ntfy".to_string())
        );
        assert_eq!(
            classifier.detect_api_source("curl https://API.TODOIST.COM/tasks"),
            Some("todoist".to_string())
        );
        assert_eq!(classifier.detect_api_source("curl https://unknown-api.com"), None);
    }

    #[test]
    fn test_custom_api_source_table_order() {
        let config = ClassifierConfig {
            api_sources: vec![
                ApiSourcePattern::new("internal", &["localhost"]),
                ApiSourcePattern::new("knowledge", &["localhost:3000"]),
            ],
            ..ClassifierConfig::default()
        };
        let classifier = ErrorClassifier::with_config(config);
        assert_eq!(
            classifier.detect_api_source("curl localhost:3000/api"),
            Some("internal".to_string())
        );
    }

    // =========================================================================
    // Breaker signal and retry delays
    // =========================================================================

    #[test]
    fn test_breaker_signal() {
        assert_eq!(ErrorCategory::Success.breaker_signal(), Some(CallOutcome::Success));
        assert_eq!(ErrorCategory::ServerError.breaker_signal(), Some(CallOutcome::Failure));
        assert_eq!(ErrorCategory::NetworkError.breaker_signal(), Some(CallOutcome::Failure));
        assert_eq!(ErrorCategory::RateLimit.breaker_signal(), None);
        assert_eq!(ErrorCategory::ClientError.breaker_signal(), None);
        assert_eq!(ErrorCategory::Unknown.breaker_signal(), None);
    }

    #[test]
    fn test_exponential_retry_delay() {
        let result = classify("curl api", "connection refused", 7);
        let backoff = BackoffPolicy::default();
        assert_eq!(result.retry_delay(0, &backoff), Some(Duration::from_secs(5)));
        assert_eq!(result.retry_delay(1, &backoff), Some(Duration::from_secs(10)));
        assert_eq!(result.retry_delay(2, &backoff), Some(Duration::from_secs(20)));
        assert_eq!(result.retry_delay(3, &backoff), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = BackoffPolicy {
            multiplier: 10,
            max_seconds: 60,
            max_attempts: 5,
        };
        assert_eq!(backoff.delay_for(5, 4), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_stop_and_cache_never_retry() {
        let backoff = BackoffPolicy::default();
        let auth = classify("curl todoist", "HTTP/1.1 401", 22);
        let server = classify("curl todoist", "HTTP/1.1 500", 22);
        assert_eq!(auth.retry_delay(0, &backoff), None);
        assert_eq!(server.retry_delay(0, &backoff), None);
    }

    #[test]
    fn test_immediate_retries_only_once() {
        let backoff = BackoffPolicy::default();
        let result = classify("mystery", "???", 1);
        assert_eq!(result.retry_delay(0, &backoff), Some(Duration::ZERO));
        assert_eq!(result.retry_delay(1, &backoff), None);
    }

    #[test]
    fn test_config_from_yaml_partial() {
        let yaml = r#"
rate_limit_default_wait: 120
exit_codes:
  1:
    category: unknown
    intent: stop
backoff:
  max_attempts: 5
"#;
        let config: ClassifierConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limit_default_wait, 120);
        assert_eq!(config.network_base_wait, 5);
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(config.backoff.multiplier, 2);
        assert_eq!(config.api_sources.len(), 6);

        let classifier = ErrorClassifier::with_config(config);
        let result = classifier.classify("tool", "bad things", 1);
        assert_eq!(result.retry_intent, RetryIntent::Stop);
        assert!(result.should_alert);
    }

    #[test]
    fn test_category_display_matches_serde() {
        for category in [
            ErrorCategory::Success,
            ErrorCategory::RateLimit,
            ErrorCategory::ServerError,
            ErrorCategory::ClientError,
            ErrorCategory::NetworkError,
            ErrorCategory::Unknown,
        ] {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }
}

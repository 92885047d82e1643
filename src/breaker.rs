//! Per-source circuit breaker.
//!
//! Tracks the availability of each external API source the agent talks to and
//! gates calls while a source is failing.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────> Open
//!     ^                                │ check after cooldown
//!     │ success                        ▼
//!     └──────────────────────────── HalfOpen ── failure ──> Open (cooldown x2)
//! ```
//!
//! All sources share one state record (`api-health`). Every operation is a
//! single locked read-modify-write of that record, so concurrent hook
//! processes never clobber each other's counters.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::classifier::{CallOutcome, ErrorClassification};
use crate::error::Result;
use crate::state::{StateStore, StateStoreExt};

/// Source name to health record.
pub type HealthTable = BTreeMap<String, SourceHealth>;

/// The persisted table, before each entry is decoded on its own.
type RawHealthTable = BTreeMap<String, Value>;

/// Longest cooldown ever applied, whatever the configuration says (one year).
pub const MAX_COOLDOWN_SECONDS: u64 = 365 * 24 * 60 * 60;

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker settings (the `circuit_breaker` section of
/// `config/timeouts.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens (default: 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// First cooldown after opening, in seconds (default: 300).
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Upper bound for the doubled cooldown, in seconds (default: 1200).
    #[serde(default = "default_max_cooldown_seconds")]
    pub max_cooldown_seconds: u64,

    /// State record holding the health table.
    #[serde(default = "default_state_key")]
    pub state_key: String,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_max_cooldown_seconds() -> u64 {
    1200
}

fn default_state_key() -> String {
    "api-health".to_string()
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            max_cooldown_seconds: default_max_cooldown_seconds(),
            state_key: default_state_key(),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Circuit state of one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Calls are skipped until the cooldown expires.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Persisted health of one API source.
///
/// `cooldown_until` is set exactly when `state` is [`CircuitState::Open`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHealth {
    #[serde(default)]
    pub state: CircuitState,

    #[serde(
        default,
        rename = "failures",
        alias = "consecutive_failures",
        alias = "consecutiveFailures"
    )]
    pub consecutive_failures: u32,

    #[serde(
        default,
        rename = "cooldown",
        alias = "cooldown_until",
        alias = "cooldownUntil",
        deserialize_with = "lenient_timestamp"
    )]
    pub cooldown_until: Option<DateTime<Utc>>,

    /// Length of the cooldown last applied; the basis for doubling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,

    /// When the half-open probe was handed out.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub probe_granted_at: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub last_success: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub last_failure: Option<DateTime<Utc>>,
}

impl SourceHealth {
    /// Returns true if calls to this source should go through.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }
}

/// Accept RFC 3339 as well as naive ISO-8601 timestamps (read as UTC).
/// Anything unparseable reads as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_timestamp(&s)))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Answer to "may I call this source now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub source: String,
    pub state: CircuitState,
    /// False when the caller should skip the call and use a fallback.
    pub allowed: bool,
    /// True when this check moved the source from open to half-open.
    pub transitioned: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

// ============================================================================
// Breaker
// ============================================================================

/// Circuit breaker over a [`StateStore`].
///
/// # Example
///
/// ```rust
/// use warden::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
/// use warden::state::MemoryStore;
///
/// let breaker = CircuitBreaker::new(MemoryStore::new(), BreakerConfig::default());
/// for _ in 0..3 {
///     breaker.record_failure("todoist").unwrap();
/// }
/// let check = breaker.check_health("todoist").unwrap();
/// assert_eq!(check.state, CircuitState::Open);
/// assert!(!check.allowed);
/// ```
#[derive(Debug)]
pub struct CircuitBreaker<S> {
    store: S,
    config: BreakerConfig,
}

impl<S: StateStore> CircuitBreaker<S> {
    /// Create a breaker.
    pub fn new(store: S, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Get the breaker configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn base_cooldown(&self) -> u64 {
        self.config.cooldown_seconds
    }

    fn threshold(&self) -> u32 {
        self.config.failure_threshold.max(1)
    }

    /// Run `mutate` on one source's record inside a locked update.
    fn update_source<R>(
        &self,
        source: &str,
        mut mutate: impl FnMut(&mut SourceHealth) -> R,
    ) -> Result<R> {
        let updated = self.store.update(&self.config.state_key, |table: &mut RawHealthTable| {
            let mut health = decode_source(source, table.get(source).cloned());
            let output = mutate(&mut health);
            serde_json::to_value(&health).map(|value| {
                table.insert(source.to_string(), value);
                output
            })
        })?;
        if !updated.lock.is_locked() {
            debug!("Health update for '{}' ran without the lock", source);
        }
        Ok(updated.value?)
    }

    /// Check whether `source` may be called now.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn check_health(&self, source: &str) -> Result<HealthCheck> {
        self.check_health_at(source, Utc::now())
    }

    /// [`check_health`](Self::check_health) at an explicit time.
    ///
    /// An open source whose cooldown has expired moves to half-open and is
    /// granted the single probe. A half-open source whose probe is still
    /// outstanding is skipped until the grant is older than the cooldown.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn check_health_at(&self, source: &str, now: DateTime<Utc>) -> Result<HealthCheck> {
        let base = self.base_cooldown();
        let check = self.update_source(source, |health| {
            let mut transitioned = false;
            let allowed = match health.state {
                CircuitState::Closed => true,
                CircuitState::Open => match health.cooldown_until {
                    Some(until) if now < until => false,
                    _ => {
                        health.state = CircuitState::HalfOpen;
                        health.cooldown_until = None;
                        health.probe_granted_at = Some(now);
                        transitioned = true;
                        true
                    }
                },
                CircuitState::HalfOpen => {
                    let window = health.cooldown_seconds.unwrap_or(base);
                    let stale = match health.probe_granted_at {
                        Some(granted) => now - granted >= seconds(window),
                        None => true,
                    };
                    if stale {
                        health.probe_granted_at = Some(now);
                    }
                    stale
                }
            };

            HealthCheck {
                source: source.to_string(),
                state: health.state,
                allowed,
                transitioned,
                cooldown_until: health.cooldown_until,
            }
        })?;

        if check.transitioned {
            info!("Circuit for '{}' is half-open, allowing one probe", source);
        } else if !check.allowed {
            debug!("Circuit for '{}' is {}, skipping call", source, check.state);
        }
        Ok(check)
    }

    /// Record a successful call. Any state returns to closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn record_success(&self, source: &str) -> Result<SourceHealth> {
        self.record_success_at(source, Utc::now())
    }

    /// [`record_success`](Self::record_success) at an explicit time.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn record_success_at(&self, source: &str, now: DateTime<Utc>) -> Result<SourceHealth> {
        let (previous, health) = self.update_source(source, |health| {
            let previous = health.state;
            health.state = CircuitState::Closed;
            health.consecutive_failures = 0;
            health.cooldown_until = None;
            health.cooldown_seconds = None;
            health.probe_granted_at = None;
            health.last_success = Some(now);
            (previous, health.clone())
        })?;

        if previous != CircuitState::Closed {
            info!("Circuit for '{}' closed after {} recovered", source, previous);
        }
        Ok(health)
    }

    /// Record a failed call.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn record_failure(&self, source: &str) -> Result<SourceHealth> {
        self.record_failure_at(source, Utc::now())
    }

    /// [`record_failure`](Self::record_failure) at an explicit time.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn record_failure_at(&self, source: &str, now: DateTime<Utc>) -> Result<SourceHealth> {
        let threshold = self.threshold();
        let base = self.base_cooldown();
        let max = self.config.max_cooldown_seconds.max(base);

        let (previous, health) = self.update_source(source, |health| {
            let previous = health.state;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_failure = Some(now);

            match health.state {
                CircuitState::Closed if health.consecutive_failures >= threshold => {
                    open(health, now, base);
                }
                CircuitState::HalfOpen => {
                    let doubled = health.cooldown_seconds.unwrap_or(base).saturating_mul(2);
                    open(health, now, doubled.min(max));
                }
                CircuitState::Closed | CircuitState::Open => {}
            }
            (previous, health.clone())
        })?;

        if previous != CircuitState::Open && health.state == CircuitState::Open {
            warn!(
                "Circuit for '{}' opened after {} failures, cooling down for {}s",
                source,
                health.consecutive_failures,
                health.cooldown_seconds.unwrap_or(base)
            );
        }
        Ok(health)
    }

    /// Record a call outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn record_result(&self, source: &str, outcome: CallOutcome) -> Result<SourceHealth> {
        match outcome {
            CallOutcome::Success => self.record_success(source),
            CallOutcome::Failure => self.record_failure(source),
        }
    }

    /// Feed a classification into the breaker.
    ///
    /// Returns `None` without touching state when the classification has no
    /// API source or carries no breaker signal (rate limits, auth errors).
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn record_classification(
        &self,
        classification: &ErrorClassification,
    ) -> Result<Option<SourceHealth>> {
        let Some(source) = classification.api_source.as_deref() else {
            return Ok(None);
        };
        match classification.category.breaker_signal() {
            Some(outcome) => self.record_result(source, outcome).map(Some),
            None => Ok(None),
        }
    }

    /// Current health of one source, without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record is unreadable.
    pub fn health(&self, source: &str) -> Result<SourceHealth> {
        Ok(self.summary()?.remove(source).unwrap_or_default())
    }

    /// Health of every tracked source.
    ///
    /// Entries that cannot be decoded are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record is unreadable.
    pub fn summary(&self) -> Result<HealthTable> {
        let raw = self
            .store
            .read::<RawHealthTable>(&self.config.state_key)?
            .unwrap_or_default();
        Ok(raw
            .into_iter()
            .filter_map(|(source, value)| match serde_json::from_value::<SourceHealth>(value) {
                Ok(health) => Some((source, health)),
                Err(e) => {
                    warn!("Ignoring unreadable health record for '{}': {}", source, e);
                    None
                }
            })
            .collect())
    }

    /// Force a source back to closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record cannot be persisted.
    pub fn reset(&self, source: &str) -> Result<SourceHealth> {
        let health = self.update_source(source, |health| {
            let last_success = health.last_success;
            let last_failure = health.last_failure;
            *health = SourceHealth {
                last_success,
                last_failure,
                ..SourceHealth::default()
            };
            health.clone()
        })?;
        info!("Circuit for '{}' reset to closed", source);
        Ok(health)
    }
}

/// One source's record; a missing or unreadable entry starts closed.
fn decode_source(source: &str, value: Option<Value>) -> SourceHealth {
    match value.map(serde_json::from_value::<SourceHealth>) {
        Some(Ok(health)) => health,
        Some(Err(e)) => {
            warn!("Resetting unreadable health record for '{}': {}", source, e);
            SourceHealth::default()
        }
        None => SourceHealth::default(),
    }
}

fn open(health: &mut SourceHealth, now: DateTime<Utc>, cooldown: u64) {
    let cooldown = cooldown.min(MAX_COOLDOWN_SECONDS);
    health.state = CircuitState::Open;
    health.cooldown_seconds = Some(cooldown);
    health.cooldown_until = Some(
        now.checked_add_signed(seconds(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    );
    health.probe_granted_at = None;
}

/// Saturating conversion; stored records may carry any `u64`.
fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

//! Cross-process loop state.

use tracing::{debug, warn};

use super::{LoopDetector, LoopVerdict, LoopWindowState};
use crate::error::Result;
use crate::state::{StateStore, StateStoreExt, Updated};

/// Characters of the session id kept in the state key.
const SESSION_PREFIX_CHARS: usize = 8;

/// State key for a session: `loop-state-<first 8 safe chars>`.
///
/// ```rust
/// use warden::loop_detector::session_key;
///
/// assert_eq!(session_key("3f2a9c1d-77aa-4b1e"), "loop-state-3f2a9c1d");
/// assert_eq!(session_key(""), "loop-state-unknown");
/// assert_eq!(session_key("../../etc"), "loop-state-etc");
/// ```
#[must_use]
pub fn session_key(session_id: &str) -> String {
    let prefix: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .take(SESSION_PREFIX_CHARS)
        .collect();
    if prefix.is_empty() {
        "loop-state-unknown".to_string()
    } else {
        format!("loop-state-{}", prefix)
    }
}

/// Runs a [`LoopDetector`] against state persisted in a [`StateStore`].
///
/// Load, check and persist happen inside one locked update, so two processes
/// in the same session never lose each other's calls.
#[derive(Debug)]
pub struct LoopTracker<S> {
    store: S,
    detector: LoopDetector,
}

impl<S: StateStore> LoopTracker<S> {
    /// Create a tracker.
    pub fn new(store: S, detector: LoopDetector) -> Self {
        Self { store, detector }
    }

    /// Get the wrapped detector.
    #[must_use]
    pub fn detector(&self) -> &LoopDetector {
        &self.detector
    }

    /// Record one tool call for `session_id` and return the verdict.
    ///
    /// # Errors
    ///
    /// Returns an error if the session state cannot be persisted. Callers
    /// treat that as "no loop".
    pub fn record(
        &self,
        session_id: &str,
        tool_name: &str,
        params_summary: &str,
        output: &str,
    ) -> Result<Updated<LoopVerdict>> {
        let key = session_key(session_id);
        let updated = self.store.update(&key, |state: &mut LoopWindowState| {
            self.detector.check(state, tool_name, params_summary, output)
        })?;

        let verdict = &updated.value;
        if verdict.loop_detected {
            warn!(
                session = %key,
                loop_type = ?verdict.loop_type,
                warning_only = verdict.warning_only,
                "Loop suspected: {}",
                verdict.reason
            );
        } else {
            debug!(session = %key, calls = verdict.session_call_count, "No loop");
        }
        Ok(updated)
    }

    /// Current persisted state for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state record is unreadable.
    pub fn state(&self, session_id: &str) -> Result<LoopWindowState> {
        Ok(self
            .store
            .read::<LoopWindowState>(&session_key(session_id))?
            .unwrap_or_default())
    }
}

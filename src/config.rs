//! Configuration for Warden.
//!
//! Settings come from three YAML files, searched for by [`ConfigLocations`],
//! plus a handful of environment variables:
//!
//! | File | Contents |
//! |------|----------|
//! | `hook-rules.yaml` | policy rules and presets |
//! | `error-patterns.yaml` | [`ClassifierConfig`] |
//! | `timeouts.yaml` | `loop_detection` and `circuit_breaker` sections |
//!
//! Every file is optional. A file that fails to parse is logged and replaced
//! by built-in defaults, so a typo in configuration never stops a hook.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::breaker::BreakerConfig;
use crate::classifier::{ClassifierConfig, ErrorClassifier};
use crate::error::{Result, WardenError};
use crate::loop_detector::{LoopDetector, LoopDetectorConfig};
use crate::policy::{PolicyEngine, RuleSet, Selection};
use crate::state::FileStore;

/// Directory holding configuration files, relative to a search root.
pub const CONFIG_DIR: &str = "config";

/// Directory holding state files, relative to the project root.
pub const STATE_DIR: &str = "state";

/// Policy rule file name.
pub const RULES_FILE: &str = "hook-rules.yaml";

/// Classifier settings file name.
pub const ERROR_PATTERNS_FILE: &str = "error-patterns.yaml";

/// Loop detection and breaker settings file name.
pub const TIMEOUTS_FILE: &str = "timeouts.yaml";

/// Overrides `loop_detection.warning_mode` (`true`/`false`).
pub const ENV_LOOP_WARNING_MODE: &str = "WARDEN_LOOP_WARNING_MODE";

/// Agent task type used for the loop detector's call budget.
pub const ENV_AGENT_TYPE: &str = "WARDEN_AGENT_TYPE";

/// Trace id attached to block events.
pub const ENV_TRACE_ID: &str = "WARDEN_TRACE_ID";

/// Session phase attached to block events.
pub const ENV_PHASE: &str = "WARDEN_PHASE";

/// Ordered list of directories searched for configuration files.
///
/// Search order:
/// 1. `<project>/config/`
/// 2. `<cwd>/config/` (when it differs from the project)
/// 3. `{config_dir}/warden/` (per-user, via the `dirs` crate)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLocations {
    dirs: Vec<PathBuf>,
}

impl ConfigLocations {
    /// Default search path for a project.
    #[must_use]
    pub fn for_project(project_root: &Path) -> Self {
        let mut dirs = vec![project_root.join(CONFIG_DIR)];
        if let Ok(cwd) = std::env::current_dir() {
            let candidate = cwd.join(CONFIG_DIR);
            if !dirs.contains(&candidate) {
                dirs.push(candidate);
            }
        }
        if let Some(user) = Self::default_user_dir() {
            dirs.push(user);
        }
        Self { dirs }
    }

    /// Search exactly the given directories, in order.
    #[must_use]
    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Per-user configuration directory.
    #[must_use]
    pub fn default_user_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("warden"))
    }

    /// Directories searched, in order.
    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First existing file named `filename`.
    #[must_use]
    pub fn find(&self, filename: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(filename))
            .find(|path| path.is_file())
    }
}

/// Layout of `timeouts.yaml`; other sections are ignored.
#[derive(Debug, Default, Deserialize)]
struct TimeoutsFile {
    #[serde(default)]
    loop_detection: Option<LoopDetectorConfig>,
    #[serde(default)]
    circuit_breaker: Option<BreakerConfig>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    /// Rule file, if one was found.
    pub rules_path: Option<PathBuf>,
    pub classifier: ClassifierConfig,
    pub breaker: BreakerConfig,
    pub loop_detection: LoopDetectorConfig,
    pub selection: Selection,
    pub agent_type: String,
    pub trace_id: Option<String>,
    pub phase: Option<String>,
}

impl WardenConfig {
    /// Built-in defaults for `project_root`, ignoring files and environment.
    pub fn defaults(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            state_dir: project_root.join(STATE_DIR),
            project_root,
            rules_path: None,
            classifier: ClassifierConfig::default(),
            breaker: BreakerConfig::default(),
            loop_detection: LoopDetectorConfig::default(),
            selection: Selection::default(),
            agent_type: "default".to_string(),
            trace_id: None,
            phase: None,
        }
    }

    /// Load configuration for `project_root` from the default locations and
    /// the process environment.
    #[must_use]
    pub fn load(project_root: &Path) -> Self {
        Self::load_with(
            project_root,
            &ConfigLocations::for_project(project_root),
            |name| std::env::var(name).ok(),
        )
    }

    /// Load configuration from explicit locations and an environment lookup.
    pub fn load_with(
        project_root: &Path,
        locations: &ConfigLocations,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut config = Self::defaults(project_root);
        config.rules_path = locations.find(RULES_FILE);

        if let Some(classifier) = load_optional::<ClassifierConfig>(locations, ERROR_PATTERNS_FILE) {
            config.classifier = classifier;
        }
        if let Some(timeouts) = load_optional::<TimeoutsFile>(locations, TIMEOUTS_FILE) {
            if let Some(loop_detection) = timeouts.loop_detection {
                config.loop_detection = loop_detection;
            }
            if let Some(breaker) = timeouts.circuit_breaker {
                config.breaker = breaker;
            }
        }

        config.selection = Selection::from_lookup(&lookup);
        if let Some(raw) = lookup(ENV_LOOP_WARNING_MODE) {
            match parse_bool(&raw) {
                Some(flag) => config.loop_detection.warning_mode = flag,
                None => warn!("Ignoring unknown {}='{}'", ENV_LOOP_WARNING_MODE, raw),
            }
        }
        if let Some(agent_type) = non_empty(lookup(ENV_AGENT_TYPE)) {
            config.agent_type = agent_type;
        }
        config.trace_id = non_empty(lookup(ENV_TRACE_ID));
        config.phase = non_empty(lookup(ENV_PHASE));
        config
    }

    /// State store rooted at the project's state directory.
    #[must_use]
    pub fn state_store(&self) -> FileStore {
        FileStore::new(&self.state_dir)
    }

    /// Rule set from the rule file, or the built-in rules.
    #[must_use]
    pub fn rule_set(&self) -> RuleSet {
        RuleSet::load_or_builtin(self.rules_path.as_deref())
    }

    /// Policy engine for the active selection.
    #[must_use]
    pub fn policy_engine(&self) -> PolicyEngine {
        PolicyEngine::new(self.rule_set(), &self.selection, &self.project_root)
    }

    /// Error classifier.
    #[must_use]
    pub fn error_classifier(&self) -> ErrorClassifier {
        ErrorClassifier::with_config(self.classifier.clone())
    }

    /// Loop detector for the configured agent type.
    ///
    /// # Errors
    ///
    /// Returns an error if a whitelist pattern is invalid.
    pub fn loop_detector(&self) -> Result<LoopDetector> {
        Ok(LoopDetector::new(self.loop_detection.clone())?.with_agent_type(&self.agent_type))
    }
}

/// Parse a YAML file into `T`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WardenError::config_with_path(format!("Cannot read {}: {}", path.display(), e), path.to_path_buf())
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        WardenError::config_with_path(format!("Cannot parse {}: {}", path.display(), e), path.to_path_buf())
    })
}

/// Parse every configuration file that exists and report each outcome.
#[must_use]
pub fn validate_files(locations: &ConfigLocations) -> Vec<(PathBuf, Result<()>)> {
    let mut results = Vec::new();
    if let Some(path) = locations.find(RULES_FILE) {
        let outcome = RuleSet::load(&path).map(|_| ());
        results.push((path, outcome));
    }
    if let Some(path) = locations.find(ERROR_PATTERNS_FILE) {
        let outcome = load_yaml::<ClassifierConfig>(&path).map(|_| ());
        results.push((path, outcome));
    }
    if let Some(path) = locations.find(TIMEOUTS_FILE) {
        let outcome = load_yaml::<TimeoutsFile>(&path).and_then(|timeouts| {
            match timeouts.loop_detection {
                Some(loop_detection) => LoopDetector::new(loop_detection).map(|_| ()),
                None => Ok(()),
            }
        });
        results.push((path, outcome));
    }
    results
}

fn load_optional<T: DeserializeOwned>(locations: &ConfigLocations, filename: &str) -> Option<T> {
    let path = locations.find(filename)?;
    match load_yaml(&path) {
        Ok(value) => {
            debug!("Loaded {}", path.display());
            Some(value)
        }
        Err(e) => {
            warn!("Using defaults instead of {}: {}", path.display(), e);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

//! Priority-tiered policy rules for shell commands and file access.
//!
//! # Architecture
//!
//! ```text
//! hook-rules.yaml ──RuleSet::load──> RuleSet ──PolicyEngine::new(selection)──> PolicyEngine
//!        (missing/invalid → RuleSet::builtin())      filter by preset + level,
//!                                                     stable sort by priority
//!
//! PolicyEngine::check_bash_command("rm -rf /")
//!     -> first matching rule wins -> PolicyDecision::Block { rule_id, reason, guard_tag }
//! ```
//!
//! Critical rules survive every preset and every security level.

pub mod defaults;
pub mod loader;
pub mod path;
pub mod rules;

pub use loader::{RuleSet, RuleSource};
pub use rules::{Matcher, PolicyDecision, Preset, Priority, Rule, Section, Subject};

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the active preset.
pub const ENV_SECURITY_PRESET: &str = "WARDEN_SECURITY_PRESET";

/// Environment variable naming the lowest enforced priority.
pub const ENV_SECURITY_LEVEL: &str = "WARDEN_SECURITY_LEVEL";

/// Which rules are active: a preset name plus a minimum priority tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub preset: String,
    /// Rules below this tier are dropped (critical rules never are).
    pub level: Priority,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            preset: "strict".to_string(),
            level: Priority::Low,
        }
    }
}

impl Selection {
    /// Create a selection.
    pub fn new(preset: impl Into<String>, level: Priority) -> Self {
        Self {
            preset: preset.into(),
            level,
        }
    }

    /// Read the selection from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the selection through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut selection = Self::default();
        if let Some(preset) = lookup(ENV_SECURITY_PRESET).filter(|p| !p.trim().is_empty()) {
            selection.preset = preset.trim().to_string();
        }
        if let Some(level) = lookup(ENV_SECURITY_LEVEL).filter(|l| !l.trim().is_empty()) {
            match Priority::parse(&level) {
                Some(priority) => selection.level = priority,
                None => warn!("Ignoring unknown {}='{}'", ENV_SECURITY_LEVEL, level),
            }
        }
        selection
    }
}

/// Evaluates commands and paths against the active rules.
///
/// # Example
///
/// ```rust
/// use warden::policy::{PolicyEngine, RuleSet, Selection};
///
/// let engine = PolicyEngine::new(RuleSet::builtin(), &Selection::default(), "/work/project");
/// let decision = engine.check_bash_command("rm -rf /");
/// assert_eq!(decision.guard_tag(), Some("safety-guard"));
/// assert!(!engine.check_bash_command("rm -rf ./temp").is_blocked());
/// ```
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    bash: Vec<Rule>,
    write: Vec<Rule>,
    read: Vec<Rule>,
    project_root: PathBuf,
    selection: Selection,
    source: RuleSource,
}

impl PolicyEngine {
    /// Build an engine from a rule set, keeping only the selected rules.
    ///
    /// A relative `project_root` is anchored at the current directory.
    pub fn new(rule_set: RuleSet, selection: &Selection, project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let project_root = path::absolute_root(&project_root).unwrap_or(project_root);
        let preset = rule_set.presets().get(&selection.preset);
        if preset.is_none() {
            warn!(
                "Unknown preset '{}', enabling every rule of {}",
                selection.preset,
                rule_set.source()
            );
        }

        let active = |section: Section| -> Vec<Rule> {
            let mut rules: Vec<Rule> = rule_set
                .rules(section)
                .iter()
                .filter(|rule| is_selected(rule, preset, selection.level))
                .cloned()
                .collect();
            rules.sort_by_key(|rule| rule.priority);
            rules
        };

        let engine = Self {
            bash: active(Section::Bash),
            write: active(Section::Write),
            read: active(Section::Read),
            project_root,
            selection: selection.clone(),
            source: rule_set.source().clone(),
        };
        debug!(
            "Policy engine ready: {} bash, {} write, {} read rules (preset '{}', level {})",
            engine.bash.len(),
            engine.write.len(),
            engine.read.len(),
            selection.preset,
            selection.level
        );
        engine
    }

    /// Active rules of a section, in evaluation order.
    #[must_use]
    pub fn rules(&self, section: Section) -> &[Rule] {
        match section {
            Section::Bash => &self.bash,
            Section::Write => &self.write,
            Section::Read => &self.read,
        }
    }

    /// Get the project root paths are resolved against.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Get the active selection.
    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Where the rules came from.
    #[must_use]
    pub fn source(&self) -> &RuleSource {
        &self.source
    }

    /// Evaluate one subject. The first matching rule wins.
    #[must_use]
    pub fn check(&self, section: Section, subject: &str) -> PolicyDecision {
        if subject.trim().is_empty() {
            return PolicyDecision::Allow;
        }
        let subject = match section {
            Section::Bash => Subject::command(subject, &self.project_root),
            Section::Write | Section::Read => Subject::path(subject, &self.project_root),
        };

        for rule in self.rules(section) {
            if let Some(reason) = rule.evaluate(&subject) {
                debug!("Rule '{}' matched {} subject", rule.id, section);
                return PolicyDecision::Block {
                    rule_id: rule.id.clone(),
                    reason,
                    guard_tag: rule.guard_tag.clone(),
                };
            }
        }
        PolicyDecision::Allow
    }

    /// Evaluate a shell command.
    #[must_use]
    pub fn check_bash_command(&self, command: &str) -> PolicyDecision {
        self.check(Section::Bash, command)
    }

    /// Evaluate a file write or edit target.
    #[must_use]
    pub fn check_write_path(&self, path: &str) -> PolicyDecision {
        self.check(Section::Write, path)
    }

    /// Evaluate a file read target.
    #[must_use]
    pub fn check_read_path(&self, path: &str) -> PolicyDecision {
        self.check(Section::Read, path)
    }
}

fn is_selected(rule: &Rule, preset: Option<&Preset>, level: Priority) -> bool {
    if rule.priority == Priority::Critical {
        return true;
    }
    rule.priority <= level && preset.map_or(true, |p| p.allows(rule))
}

//! Decoding `hook-rules.yaml` into a [`RuleSet`].
//!
//! The file has three rule sections and a preset table:
//!
//! ```yaml
//! bash_rules:
//!   - id: destructive-delete
//!     priority: critical
//!     pattern: 'rm\s+-rf\s+/(\s|$)'
//!     reason: Recursive delete of / is not allowed
//!     guard_tag: safety-guard
//! write_rules:
//!   - id: sensitive-files
//!     check: basename_in
//!     values: [.env, token.json]
//!     reason_template: "Writing sensitive file is not allowed: {matched}"
//! presets:
//!   standard:
//!     disabled_rules: [sensitive-env]
//!   minimal:
//!     enabled_priorities: [critical, high]
//! ```
//!
//! Decoding is strict: an unknown `check`, a bad regex, a missing pattern or a
//! duplicate ID fails the whole load. Missing sections fall back to the
//! built-in rules for that section.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::defaults;
use super::rules::{Matcher, Preset, Priority, Rule, Section};
use crate::error::{Result, WardenError};

/// Where a rule set came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    BuiltIn,
    File(PathBuf),
}

impl std::fmt::Display for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuiltIn => write!(f, "built-in rules"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// All rules and presets, unfiltered.
#[derive(Debug, Clone)]
pub struct RuleSet {
    bash: Vec<Rule>,
    write: Vec<Rule>,
    read: Vec<Rule>,
    presets: BTreeMap<String, Preset>,
    source: RuleSource,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuleSet {
    /// The built-in rule set.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            bash: defaults::bash_rules(),
            write: defaults::write_rules(),
            read: defaults::read_rules(),
            presets: defaults::presets(),
            source: RuleSource::BuiltIn,
        }
    }

    /// Decode a rule file's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or any rule is invalid.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawRuleFile = serde_yaml::from_str(content)?;

        let mut sections: BTreeMap<Section, Vec<Rule>> = BTreeMap::new();
        for section in Section::all() {
            let rules = match raw.section(section) {
                Some(entries) if !entries.is_empty() => entries
                    .iter()
                    .map(|entry| entry.compile(section))
                    .collect::<Result<Vec<_>>>()?,
                _ => {
                    debug!("No {} in rule file, using built-in rules", section.yaml_key());
                    defaults::rules_for(section)
                }
            };
            sections.insert(section, rules);
        }

        let presets = if raw.presets.is_empty() {
            defaults::presets()
        } else {
            raw.presets
                .iter()
                .map(|(name, preset)| Ok((name.clone(), preset.compile(name)?)))
                .collect::<Result<BTreeMap<_, _>>>()?
        };

        let rule_set = Self {
            bash: sections.remove(&Section::Bash).unwrap_or_default(),
            write: sections.remove(&Section::Write).unwrap_or_default(),
            read: sections.remove(&Section::Read).unwrap_or_default(),
            presets,
            source: RuleSource::BuiltIn,
        };
        rule_set.check_unique_ids()?;
        Ok(rule_set)
    }

    /// Load a rule file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::config_with_path(format!("Cannot read rule file: {}", e), path.to_path_buf())
        })?;
        let mut rule_set = Self::from_yaml(&content)?;
        rule_set.source = RuleSource::File(path.to_path_buf());
        Ok(rule_set)
    }

    /// Load `path` if given, falling back to the built-in rules on any error.
    #[must_use]
    pub fn load_or_builtin(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            debug!("No rule file found, using built-in rules");
            return Self::builtin();
        };
        match Self::load(path) {
            Ok(rule_set) => rule_set,
            Err(e) => {
                warn!("Falling back to built-in rules, {} is invalid: {}", path.display(), e);
                Self::builtin()
            }
        }
    }

    fn check_unique_ids(&self) -> Result<()> {
        let mut seen: HashMap<&str, Section> = HashMap::new();
        for rule in self.bash.iter().chain(&self.write).chain(&self.read) {
            if let Some(first) = seen.insert(&rule.id, rule.section) {
                return Err(WardenError::DuplicateRule {
                    rule_id: rule.id.clone(),
                    first: first.yaml_key().to_string(),
                    second: rule.section.yaml_key().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Rules of one section, in file order.
    #[must_use]
    pub fn rules(&self, section: Section) -> &[Rule] {
        match section {
            Section::Bash => &self.bash,
            Section::Write => &self.write,
            Section::Read => &self.read,
        }
    }

    /// Preset table.
    #[must_use]
    pub fn presets(&self) -> &BTreeMap<String, Preset> {
        &self.presets
    }

    /// Where the rules came from.
    #[must_use]
    pub fn source(&self) -> &RuleSource {
        &self.source
    }

    /// Total number of rules across sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bash.len() + self.write.len() + self.read.len()
    }

    /// Returns true if there are no rules at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Raw YAML shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RawRuleFile {
    #[serde(default)]
    bash_rules: Option<Vec<RawRule>>,
    #[serde(default)]
    write_rules: Option<Vec<RawRule>>,
    #[serde(default)]
    read_rules: Option<Vec<RawRule>>,
    #[serde(default)]
    presets: BTreeMap<String, RawPreset>,
}

impl RawRuleFile {
    fn section(&self, section: Section) -> Option<&Vec<RawRule>> {
        match section {
            Section::Bash => self.bash_rules.as_ref(),
            Section::Write => self.write_rules.as_ref(),
            Section::Read => self.read_rules.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    check: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default, alias = "exclude", alias = "exclude_patterns")]
    exclusions: Vec<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    case_insensitive: Option<bool>,
    #[serde(default)]
    flags: Option<String>,
    #[serde(default, alias = "contains")]
    precondition: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    reason_template: Option<String>,
    #[serde(default)]
    guard_tag: Option<String>,
    #[serde(default)]
    allow_inside_root: Option<bool>,
    #[serde(default)]
    description: Option<String>,
}

impl RawRule {
    fn compile(&self, section: Section) -> Result<Rule> {
        let invalid = |reason: String| WardenError::invalid_rule(section.yaml_key(), &self.id, reason);

        if self.id.trim().is_empty() {
            return Err(invalid("rule id is empty".to_string()));
        }

        let priority = match &self.priority {
            Some(name) => Priority::parse(name)
                .ok_or_else(|| invalid(format!("unknown priority '{}'", name)))?,
            None => Priority::default(),
        };

        let matcher = self.matcher(section)?;
        if section == Section::Bash && matcher.is_path_only() {
            return Err(invalid(format!(
                "check '{}' only applies to paths",
                matcher.kind()
            )));
        }

        let reason = self
            .reason_template
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_else(|| format!("Blocked by rule: {}", self.id));

        Ok(Rule {
            id: self.id.clone(),
            section,
            priority,
            matcher,
            precondition: self.precondition.clone().filter(|p| !p.is_empty()),
            reason,
            guard_tag: self.guard_tag.clone().unwrap_or_else(|| self.id.clone()),
            allow_inside_root: self.allow_inside_root.unwrap_or(section == Section::Read),
            description: self.description.clone(),
        })
    }

    fn case_insensitive(&self, section: Section) -> bool {
        if let Some(flag) = self.case_insensitive {
            return flag;
        }
        match &self.flags {
            Some(flags) => flags
                .to_ascii_lowercase()
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|flag| flag == "i" || flag == "ignorecase"),
            None => section == Section::Read,
        }
    }

    fn matcher(&self, section: Section) -> Result<Matcher> {
        let invalid = |reason: String| WardenError::invalid_rule(section.yaml_key(), &self.id, reason);
        let kind = self
            .check
            .as_deref()
            .map(|c| c.trim().to_ascii_lowercase().replace('-', "_"));

        match kind.as_deref() {
            None | Some("pattern") | Some("pattern_list") | Some("path_match") => {
                let mut sources: Vec<&str> = self.pattern.iter().map(String::as_str).collect();
                sources.extend(self.patterns.iter().map(String::as_str));
                if sources.is_empty() {
                    return Err(invalid("no pattern given".to_string()));
                }
                let ci = self.case_insensitive(section);
                Ok(Matcher::PatternList {
                    patterns: self.compile_all(&sources, ci)?,
                    exclusions: self.compile_all(
                        &self.exclusions.iter().map(String::as_str).collect::<Vec<_>>(),
                        ci,
                    )?,
                })
            }
            Some("basename_equals") => {
                let value = self
                    .value
                    .clone()
                    .or_else(|| self.values.first().cloned())
                    .ok_or_else(|| invalid("basename_equals needs a value".to_string()))?;
                Ok(Matcher::BasenameEquals {
                    value,
                    case_insensitive: self.case_insensitive.unwrap_or(true),
                })
            }
            Some("basename_in") => {
                let mut values = self.values.clone();
                values.extend(self.value.clone());
                if values.is_empty() {
                    return Err(invalid("basename_in needs values".to_string()));
                }
                Ok(Matcher::BasenameIn { values })
            }
            Some("path_contains") => {
                let value = self
                    .value
                    .clone()
                    .or_else(|| self.pattern.clone())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| invalid("path_contains needs a value".to_string()))?;
                Ok(Matcher::PathContains { value })
            }
            Some("path_traversal") => Ok(Matcher::PathTraversal),
            Some(other) => Err(invalid(format!("unknown check '{}'", other))),
        }
    }

    fn compile_all(&self, sources: &[&str], case_insensitive: bool) -> Result<Vec<Regex>> {
        sources
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|source| WardenError::InvalidPattern {
                        rule_id: self.id.clone(),
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawPreset {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    disabled_rules: Option<Vec<String>>,
    #[serde(default)]
    enabled_priorities: Option<Vec<String>>,
}

impl RawPreset {
    fn compile(&self, name: &str) -> Result<Preset> {
        match (&self.disabled_rules, &self.enabled_priorities) {
            (Some(_), Some(_)) => Err(WardenError::InvalidConfig {
                field: format!("presets.{}", name),
                reason: "use either disabled_rules or enabled_priorities, not both".to_string(),
            }),
            (_, Some(priorities)) => {
                let priorities = priorities
                    .iter()
                    .map(|p| {
                        Priority::parse(p).ok_or_else(|| WardenError::InvalidConfig {
                            field: format!("presets.{}.enabled_priorities", name),
                            reason: format!("unknown priority '{}'", p),
                        })
                    })
                    .collect::<Result<_>>()?;
                Ok(Preset::EnabledPriorities {
                    description: self.description.clone(),
                    priorities,
                })
            }
            (disabled, None) => Ok(Preset::DisabledRules {
                description: self.description.clone(),
                rules: disabled.iter().flatten().cloned().collect(),
            }),
        }
    }
}

//! Rule types and matching.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use super::path::{basename, is_within_root, normalize_slashes, ResolvedPath};

// ============================================================================
// Priority and sections
// ============================================================================

/// Rule importance. Orders `Critical < High < Medium < Low`, which is also the
/// evaluation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    #[default]
    High,
    Medium,
    Low,
}

impl Priority {
    /// Parse a priority name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Returns all priorities in evaluation order.
    #[must_use]
    pub fn all() -> [Priority; 4] {
        [Self::Critical, Self::High, Self::Medium, Self::Low]
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Which kind of subject a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    /// Shell commands.
    Bash,
    /// File write and edit targets.
    Write,
    /// File read targets.
    Read,
}

impl Section {
    /// YAML key holding this section's rules.
    #[must_use]
    pub fn yaml_key(&self) -> &'static str {
        match self {
            Self::Bash => "bash_rules",
            Self::Write => "write_rules",
            Self::Read => "read_rules",
        }
    }

    /// Returns all sections.
    #[must_use]
    pub fn all() -> [Section; 3] {
        [Self::Bash, Self::Write, Self::Read]
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
        }
    }
}

impl std::str::FromStr for Section {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bash" | "bash_rules" => Ok(Self::Bash),
            "write" | "write_rules" => Ok(Self::Write),
            "read" | "read_rules" => Ok(Self::Read),
            other => Err(format!("unknown rule section '{}'", other)),
        }
    }
}

// ============================================================================
// Matchers
// ============================================================================

/// How a rule recognizes its subject.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Regex search over the command or the slash-normalized path. An
    /// exclusion match vetoes the rule.
    PatternList {
        patterns: Vec<Regex>,
        exclusions: Vec<Regex>,
    },
    /// The path's file name equals `value`.
    BasenameEquals {
        value: String,
        case_insensitive: bool,
    },
    /// The path's file name is one of `values`.
    BasenameIn { values: Vec<String> },
    /// The path contains `value`.
    PathContains { value: String },
    /// The path contains `..` and resolves outside the project root.
    PathTraversal,
}

impl Matcher {
    /// Short kind name, as written in rule files.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PatternList { .. } => "pattern_list",
            Self::BasenameEquals { .. } => "basename_equals",
            Self::BasenameIn { .. } => "basename_in",
            Self::PathContains { .. } => "path_contains",
            Self::PathTraversal => "path_traversal",
        }
    }

    /// Returns true if this matcher only makes sense for paths.
    #[must_use]
    pub fn is_path_only(&self) -> bool {
        !matches!(self, Self::PatternList { .. })
    }

    /// Test the matcher against a subject.
    #[must_use]
    pub fn matches(&self, subject: &Subject<'_>) -> Option<MatchInfo> {
        match self {
            Self::PatternList {
                patterns,
                exclusions,
            } => {
                let text = subject.normalized.as_str();
                if exclusions.iter().any(|re| re.is_match(text)) {
                    return None;
                }
                patterns
                    .iter()
                    .find_map(|re| re.find(text))
                    .map(|m| MatchInfo::new(m.as_str()))
            }
            Self::BasenameEquals {
                value,
                case_insensitive,
            } => {
                let name = subject.basename();
                let hit = if *case_insensitive {
                    name.eq_ignore_ascii_case(value)
                } else {
                    name == value
                };
                hit.then(|| MatchInfo::new(name))
            }
            Self::BasenameIn { values } => {
                let name = subject.basename();
                values
                    .iter()
                    .find(|v| {
                        name == v.as_str() || subject.normalized.ends_with(&format!("/{}", v))
                    })
                    .map(|v| MatchInfo::new(v))
            }
            Self::PathContains { value } => subject
                .normalized
                .contains(value.as_str())
                .then(|| MatchInfo::new(value)),
            Self::PathTraversal => {
                if !subject.raw.contains("..") {
                    return None;
                }
                let root = ResolvedPath::resolve(".", subject.project_root);
                let resolved = ResolvedPath::resolve(subject.raw, subject.project_root);
                if resolved.is_within(&root) {
                    None
                } else {
                    let mut info = MatchInfo::new("..");
                    info.resolved = Some(resolved.to_string());
                    Some(info)
                }
            }
        }
    }
}

/// What a matcher saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchInfo {
    pub matched: String,
    pub resolved: Option<String>,
}

impl MatchInfo {
    fn new(matched: &str) -> Self {
        Self {
            matched: matched.to_string(),
            resolved: None,
        }
    }
}

/// One command or path under evaluation.
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    pub raw: &'a str,
    pub normalized: String,
    pub project_root: &'a Path,
}

impl<'a> Subject<'a> {
    /// A shell command. Commands are matched verbatim.
    #[must_use]
    pub fn command(raw: &'a str, project_root: &'a Path) -> Self {
        Self {
            raw,
            normalized: raw.to_string(),
            project_root,
        }
    }

    /// A file path, matched in forward-slash form.
    #[must_use]
    pub fn path(raw: &'a str, project_root: &'a Path) -> Self {
        Self {
            raw,
            normalized: normalize_slashes(raw),
            project_root,
        }
    }

    /// Final path component.
    #[must_use]
    pub fn basename(&self) -> &str {
        basename(&self.normalized)
    }

    /// Returns true if the path resolves inside the project root.
    #[must_use]
    pub fn is_within_root(&self) -> bool {
        is_within_root(self.raw, self.project_root)
    }
}

// ============================================================================
// Rules
// ============================================================================

/// A compiled policy rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub section: Section,
    pub priority: Priority,
    pub matcher: Matcher,
    /// Substring that must appear in the subject before matching.
    pub precondition: Option<String>,
    /// Reason template; `{matched}`, `{resolved}` and `{path}` are expanded.
    pub reason: String,
    pub guard_tag: String,
    /// Skip the rule when the path resolves inside the project root.
    pub allow_inside_root: bool,
    pub description: Option<String>,
}

impl Rule {
    /// Evaluate this rule. Returns the expanded reason on a hit.
    #[must_use]
    pub fn evaluate(&self, subject: &Subject<'_>) -> Option<String> {
        if let Some(needle) = &self.precondition {
            if !subject.normalized.contains(needle.as_str()) {
                return None;
            }
        }
        let info = self.matcher.matches(subject)?;
        if self.allow_inside_root && subject.is_within_root() {
            return None;
        }
        Some(self.expand_reason(&info, subject.raw))
    }

    fn expand_reason(&self, info: &MatchInfo, raw: &str) -> String {
        self.reason
            .replace("{matched}", &info.matched)
            .replace("{resolved}", info.resolved.as_deref().unwrap_or(raw))
            .replace("{path}", raw)
    }
}

// ============================================================================
// Presets
// ============================================================================

/// A named selection of active rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preset {
    /// Every rule except the listed IDs.
    DisabledRules {
        description: Option<String>,
        rules: BTreeSet<String>,
    },
    /// Only rules of the listed priorities.
    EnabledPriorities {
        description: Option<String>,
        priorities: BTreeSet<Priority>,
    },
}

impl Preset {
    /// Returns true if the preset keeps `rule` active. Critical rules are
    /// always kept.
    #[must_use]
    pub fn allows(&self, rule: &Rule) -> bool {
        if rule.priority == Priority::Critical {
            return true;
        }
        match self {
            Self::DisabledRules { rules, .. } => !rules.contains(&rule.id),
            Self::EnabledPriorities { priorities, .. } => priorities.contains(&rule.priority),
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::DisabledRules { description, .. } | Self::EnabledPriorities { description, .. } => {
                description.as_deref()
            }
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    Block {
        rule_id: String,
        reason: String,
        guard_tag: String,
    },
}

impl PolicyDecision {
    /// Returns true if the subject was blocked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    /// Block reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Block { reason, .. } => Some(reason),
        }
    }

    /// Guard tag of the blocking rule, if any.
    #[must_use]
    pub fn guard_tag(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Block { guard_tag, .. } => Some(guard_tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> &'static Path {
        Path::new("/work/project")
    }

    fn rule(matcher: Matcher) -> Rule {
        Rule {
            id: "test".into(),
            section: Section::Write,
            priority: Priority::High,
            matcher,
            precondition: None,
            reason: "blocked {matched} ({resolved})".into(),
            guard_tag: "test-guard".into(),
            allow_inside_root: false,
            description: None,
        }
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::default(), Priority::High);
        assert_eq!(Priority::parse(" MEDIUM "), Some(Priority::Medium));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_section_from_str() {
        assert_eq!("bash".parse::<Section>().unwrap(), Section::Bash);
        assert_eq!("read_rules".parse::<Section>().unwrap(), Section::Read);
        assert!("exec".parse::<Section>().is_err());
    }

    #[test]
    fn test_basename_in_requires_whole_name() {
        let rule = rule(Matcher::BasenameIn {
            values: vec![".env".into(), "credentials.json".into()],
        });
        assert!(rule.evaluate(&Subject::path(".env", root())).is_some());
        assert!(rule.evaluate(&Subject::path("config\\.env", root())).is_some());
        assert!(rule.evaluate(&Subject::path(".env.example", root())).is_none());
        assert!(rule.evaluate(&Subject::path("my-credentials-doc.md", root())).is_none());
        assert!(rule.evaluate(&Subject::path("prod.env", root())).is_none());
    }

    #[test]
    fn test_basename_equals_case_insensitive() {
        let rule = rule(Matcher::BasenameEquals {
            value: "nul".into(),
            case_insensitive: true,
        });
        assert!(rule.evaluate(&Subject::path("out/NUL", root())).is_some());
        assert!(rule.evaluate(&Subject::path("null", root())).is_none());
    }

    #[test]
    fn test_pattern_exclusion_vetoes() {
        let rule = rule(Matcher::PatternList {
            patterns: vec![Regex::new(r"\.env").unwrap()],
            exclusions: vec![Regex::new(r"\.env\.(example|sample|template)").unwrap()],
        });
        assert!(rule.evaluate(&Subject::path("/srv/app/.env", root())).is_some());
        assert!(rule.evaluate(&Subject::path("/srv/app/.env.example", root())).is_none());
    }

    #[test]
    fn test_precondition_gates_matching() {
        let mut rule = rule(Matcher::PatternList {
            patterns: vec![Regex::new(">").unwrap()],
            exclusions: vec![],
        });
        rule.precondition = Some("scheduler-state.json".into());
        assert!(rule
            .evaluate(&Subject::command("echo x > scheduler-state.json", root()))
            .is_some());
        assert!(rule.evaluate(&Subject::command("echo x > other.json", root())).is_none());
    }

    #[test]
    fn test_path_traversal_reports_resolved_path() {
        let rule = rule(Matcher::PathTraversal);
        let reason = rule
            .evaluate(&Subject::path("../../etc/passwd", root()))
            .unwrap();
        assert!(reason.contains("/etc/passwd"));
        assert!(rule.evaluate(&Subject::path("src/../README.md", root())).is_none());
        assert!(rule.evaluate(&Subject::path("/etc/passwd", root())).is_none());
    }

    #[test]
    fn test_allow_inside_root() {
        let mut rule = rule(Matcher::BasenameIn {
            values: vec![".env".into()],
        });
        rule.allow_inside_root = true;
        assert!(rule.evaluate(&Subject::path(".env", root())).is_none());
        assert!(rule.evaluate(&Subject::path("/home/me/.env", root())).is_some());
    }

    #[test]
    fn test_preset_never_drops_critical() {
        let mut critical = rule(Matcher::PathTraversal);
        critical.priority = Priority::Critical;
        critical.id = "nul-file".into();
        let mut medium = rule(Matcher::PathTraversal);
        medium.priority = Priority::Medium;

        let by_priority = Preset::EnabledPriorities {
            description: None,
            priorities: [Priority::High].into_iter().collect(),
        };
        let by_id = Preset::DisabledRules {
            description: None,
            rules: ["nul-file".to_string(), "test".to_string()].into_iter().collect(),
        };
        assert!(by_priority.allows(&critical));
        assert!(!by_priority.allows(&medium));
        assert!(by_id.allows(&critical));
        assert!(!by_id.allows(&medium));
    }

    #[test]
    fn test_decision_serializes_with_tag() {
        let decision = PolicyDecision::Block {
            rule_id: "destructive-delete".into(),
            reason: "no".into(),
            guard_tag: "safety-guard".into(),
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["decision"], "block");
        assert_eq!(json["guard_tag"], "safety-guard");
        assert_eq!(serde_json::to_value(PolicyDecision::Allow).unwrap()["decision"], "allow");
    }
}

//! Built-in rules, used when `config/hook-rules.yaml` is missing or invalid.

use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

use super::rules::{Matcher, Preset, Priority, Rule, Section};

/// Variable names treated as secrets in shell commands.
const SECRET_NAMES: &str = "(TOKEN|SECRET|PASSWORD|API_KEY|CREDENTIAL)";

pub(crate) fn compile(patterns: &[&str], case_insensitive: bool) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(case_insensitive)
                .build()
                .ok()
        })
        .collect()
}

struct RuleSpec {
    id: &'static str,
    priority: Priority,
    matcher: Matcher,
    precondition: Option<&'static str>,
    reason: &'static str,
    guard_tag: &'static str,
}

impl RuleSpec {
    fn into_rule(self, section: Section) -> Rule {
        Rule {
            id: self.id.to_string(),
            section,
            priority: self.priority,
            matcher: self.matcher,
            precondition: self.precondition.map(String::from),
            reason: self.reason.to_string(),
            guard_tag: self.guard_tag.to_string(),
            allow_inside_root: section == Section::Read,
            description: None,
        }
    }
}

fn pattern_list(patterns: &[&str], case_insensitive: bool) -> Matcher {
    Matcher::PatternList {
        patterns: compile(patterns, case_insensitive),
        exclusions: Vec::new(),
    }
}

/// Built-in shell command rules.
#[must_use]
pub fn bash_rules() -> Vec<Rule> {
    let sensitive_echo = format!(r"(echo|printf)\s.*\$\{{?\w*{}", SECRET_NAMES);
    let sensitive_printenv = format!(r"printenv\s+\w*{}", SECRET_NAMES);
    let sensitive_grep = format!(r"\benv\s*\|\s*grep\s+.*{}", SECRET_NAMES);
    let exfiltration = r"(curl|wget)\s.*(-d|--data(-\w+)?|--post-data)[\s=]+\S*\$\{?\w*(TOKEN|SECRET|PASSWORD|API_KEY|KEY|CREDENTIAL)";

    vec![
        RuleSpec {
            id: "nul-redirect",
            priority: Priority::Critical,
            matcher: pattern_list(&[r"(>|2>)\s*nul(\s|$|;|&|\|)"], true),
            precondition: None,
            reason: "Redirecting to nul is not allowed (it creates a physical 'nul' file on Windows); use > /dev/null 2>&1",
            guard_tag: "nul-guard",
        },
        RuleSpec {
            id: "scheduler-state-write",
            priority: Priority::Critical,
            matcher: pattern_list(&[r"(>|>>|tee\s|cp\s.*scheduler|mv\s.*scheduler)"], false),
            precondition: Some("scheduler-state.json"),
            reason: "Agents must not write scheduler-state.json; it is owned by the scheduler",
            guard_tag: "state-guard",
        },
        RuleSpec {
            id: "destructive-delete",
            priority: Priority::Critical,
            matcher: pattern_list(&[r"\brm\s+-([rR]f|f[rR])\s+(/|~|/\*)(\s|$)"], false),
            precondition: None,
            reason: "Recursive delete of the root or home directory is not allowed",
            guard_tag: "safety-guard",
        },
        RuleSpec {
            id: "exfiltration",
            priority: Priority::Critical,
            matcher: pattern_list(&[exfiltration], false),
            precondition: None,
            reason: "Sending secret variables over the network is not allowed",
            guard_tag: "exfiltration-guard",
        },
        RuleSpec {
            id: "force-push",
            priority: Priority::High,
            matcher: pattern_list(
                &[r"git\s+push\b.*\s(--force|-f)\s(.*\s)?(main|master)(\s|$)"],
                false,
            ),
            precondition: None,
            reason: "Force pushing to main/master is not allowed",
            guard_tag: "git-guard",
        },
        RuleSpec {
            id: "sensitive-env",
            priority: Priority::Medium,
            matcher: pattern_list(
                &[&sensitive_echo, &sensitive_printenv, &sensitive_grep],
                false,
            ),
            precondition: None,
            reason: "Printing secret environment variables is not allowed",
            guard_tag: "env-guard",
        },
    ]
    .into_iter()
    .map(|spec| spec.into_rule(Section::Bash))
    .collect()
}

/// Built-in file write rules.
#[must_use]
pub fn write_rules() -> Vec<Rule> {
    vec![
        RuleSpec {
            id: "nul-file",
            priority: Priority::High,
            matcher: Matcher::BasenameEquals {
                value: "nul".to_string(),
                case_insensitive: true,
            },
            precondition: None,
            reason: "Writing a file named 'nul' is not allowed (it creates a physical file on Windows)",
            guard_tag: "nul-guard",
        },
        RuleSpec {
            id: "scheduler-state",
            priority: Priority::High,
            matcher: Matcher::PathContains {
                value: "scheduler-state.json".to_string(),
            },
            precondition: None,
            reason: "Agents must not write scheduler-state.json; it is owned by the scheduler",
            guard_tag: "state-guard",
        },
        RuleSpec {
            id: "sensitive-files",
            priority: Priority::High,
            matcher: Matcher::BasenameIn {
                values: [".env", "credentials.json", "token.json", "secrets.json", ".htpasswd"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
            precondition: None,
            reason: "Writing sensitive file is not allowed: {matched}",
            guard_tag: "secret-guard",
        },
        RuleSpec {
            id: "path-traversal",
            priority: Priority::High,
            matcher: Matcher::PathTraversal,
            precondition: None,
            reason: "Path traversal blocked: target resolves outside the project ({resolved})",
            guard_tag: "traversal-guard",
        },
    ]
    .into_iter()
    .map(|spec| spec.into_rule(Section::Write))
    .collect()
}

/// Built-in file read rules. All of them allow paths inside the project root.
#[must_use]
pub fn read_rules() -> Vec<Rule> {
    vec![
        RuleSpec {
            id: "sensitive-path",
            priority: Priority::High,
            matcher: Matcher::PatternList {
                patterns: compile(
                    &[
                        r"\.ssh",
                        r"\.gnupg",
                        r"credentials",
                        r"\.env",
                        r"\.env\.local",
                        r"/etc/shadow",
                        r"/etc/passwd",
                        r"\.aws/credentials",
                        r"\.kube/config",
                    ],
                    true,
                ),
                exclusions: compile(
                    &[
                        r"credentials\.(example|sample)",
                        r"\.env\.(example|sample|template)",
                    ],
                    true,
                ),
            },
            precondition: None,
            reason: "Reading sensitive system path is not allowed",
            guard_tag: "read-guard",
        },
        RuleSpec {
            id: "sensitive-read-files",
            priority: Priority::High,
            matcher: Matcher::BasenameIn {
                values: [
                    ".env",
                    ".env.local",
                    "credentials.json",
                    "token.json",
                    "secrets.json",
                    ".htpasswd",
                    "id_rsa",
                    "id_ed25519",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            },
            precondition: None,
            reason: "Reading sensitive file is not allowed: {matched}",
            guard_tag: "secret-read-guard",
        },
        RuleSpec {
            id: "windows-credentials",
            priority: Priority::High,
            matcher: pattern_list(
                &[
                    r"AppData.*Roaming.*Microsoft.*Credentials",
                    r"AppData.*Roaming.*Microsoft.*Protect",
                    r"Windows.*System32.*config.*SAM",
                ],
                true,
            ),
            precondition: None,
            reason: "Reading Windows credential stores is not allowed",
            guard_tag: "win-cred-guard",
        },
    ]
    .into_iter()
    .map(|spec| spec.into_rule(Section::Read))
    .collect()
}

/// Built-in rules for one section.
#[must_use]
pub fn rules_for(section: Section) -> Vec<Rule> {
    match section {
        Section::Bash => bash_rules(),
        Section::Write => write_rules(),
        Section::Read => read_rules(),
    }
}

/// Built-in presets: `strict`, `standard` and `permissive`.
#[must_use]
pub fn presets() -> BTreeMap<String, Preset> {
    let disabled = |description: &str, ids: &[&str]| Preset::DisabledRules {
        description: Some(description.to_string()),
        rules: ids.iter().map(|id| id.to_string()).collect(),
    };
    [
        ("strict", disabled("Scheduled runs: every rule enabled", &[])),
        (
            "standard",
            disabled("Interactive development: relaxes env checks", &["sensitive-env"]),
        ),
        (
            "permissive",
            disabled("Debugging: critical rules only", &["sensitive-env", "force-push"]),
        ),
    ]
    .into_iter()
    .map(|(name, preset)| (name.to_string(), preset))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_count(rule: &Rule) -> usize {
        match &rule.matcher {
            Matcher::PatternList { patterns, .. } => patterns.len(),
            _ => 1,
        }
    }

    #[test]
    fn test_builtin_patterns_all_compile() {
        let expected = [
            ("nul-redirect", 1),
            ("scheduler-state-write", 1),
            ("destructive-delete", 1),
            ("exfiltration", 1),
            ("force-push", 1),
            ("sensitive-env", 3),
            ("sensitive-path", 9),
            ("windows-credentials", 3),
        ];
        let all: Vec<Rule> = Section::all().into_iter().flat_map(rules_for).collect();
        for (id, count) in expected {
            let rule = all.iter().find(|r| r.id == id).unwrap();
            assert_eq!(pattern_count(rule), count, "rule {}", id);
        }
    }

    #[test]
    fn test_builtin_ids_are_unique() {
        let mut ids: Vec<String> = Section::all()
            .into_iter()
            .flat_map(rules_for)
            .map(|r| r.id)
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_read_rules_allow_inside_root() {
        assert!(read_rules().iter().all(|r| r.allow_inside_root));
        assert!(write_rules().iter().all(|r| !r.allow_inside_root));
    }

    #[test]
    fn test_builtin_presets() {
        let presets = presets();
        assert_eq!(presets.len(), 3);
        assert!(matches!(
            &presets["permissive"],
            Preset::DisabledRules { rules, .. } if rules.contains("force-push")
        ));
    }
}

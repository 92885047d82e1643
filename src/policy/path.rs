//! Lexical path handling for path rules.
//!
//! Nothing here touches the file system: paths are resolved textually so a
//! rule never depends on whether the target exists.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Forward-slash form of a path.
#[must_use]
pub fn normalize_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Final component of a slash- or backslash-separated path.
#[must_use]
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// `root` as an absolute path.
///
/// A relative root is joined onto the current directory. Returns `None` when
/// the current directory is unavailable.
#[must_use]
pub fn absolute_root(root: &Path) -> Option<PathBuf> {
    if is_absolute(&normalize_slashes(&root.to_string_lossy())) {
        return Some(root.to_path_buf());
    }
    match std::env::current_dir() {
        Ok(cwd) => Some(cwd.join(root)),
        Err(e) => {
            warn!("Cannot anchor project root '{}': {}", root.display(), e);
            None
        }
    }
}

/// A lexically resolved absolute path, split into components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// `""` for Unix paths, `"C:"` for drive paths.
    prefix: String,
    components: Vec<String>,
    /// False when resolved against a root that could not be made absolute.
    anchored: bool,
}

impl ResolvedPath {
    /// Resolve `path` against `root`.
    ///
    /// Handles `~/` (home directory), Windows drive letters, and MSYS-style
    /// `/d/...` paths when the root itself is a drive path. A relative root is
    /// anchored at the current directory first.
    #[must_use]
    pub fn resolve(path: &str, root: &Path) -> Self {
        let root = Self::root(root);
        let mut normalized = normalize_slashes(path);

        if let Some(rest) = normalized.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                normalized = format!("{}/{}", normalize_slashes(&home.to_string_lossy()), rest);
            }
        }
        if !root.prefix.is_empty() {
            if let Some(converted) = msys_to_drive(&normalized) {
                normalized = converted;
            }
        }

        if is_absolute(&normalized) {
            Self::absolute(&normalized)
        } else {
            let mut resolved = root;
            resolved.push_relative(&normalized);
            resolved
        }
    }

    fn root(root: &Path) -> Self {
        match absolute_root(root) {
            Some(root) => Self::absolute(&normalize_slashes(&root.to_string_lossy())),
            None => Self {
                prefix: String::new(),
                components: Vec::new(),
                anchored: false,
            },
        }
    }

    fn absolute(path: &str) -> Self {
        let (prefix, rest) = match drive_prefix(path) {
            Some(drive) => (drive.to_ascii_uppercase(), &path[2..]),
            None => (String::new(), path),
        };
        let mut resolved = Self {
            prefix,
            components: Vec::new(),
            anchored: true,
        };
        resolved.push_relative(rest);
        resolved
    }

    fn push_relative(&mut self, path: &str) {
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    self.components.pop();
                }
                other => self.components.push(other.to_string()),
            }
        }
    }

    /// Returns true if this path is `root` or lies beneath it.
    ///
    /// Nothing lies within an unanchored root.
    #[must_use]
    pub fn is_within(&self, root: &ResolvedPath) -> bool {
        if !self.anchored || !root.anchored {
            return false;
        }
        if self.prefix != root.prefix || self.components.len() < root.components.len() {
            return false;
        }
        let case_insensitive = !self.prefix.is_empty();
        self.components
            .iter()
            .zip(&root.components)
            .all(|(a, b)| {
                if case_insensitive {
                    a.eq_ignore_ascii_case(b)
                } else {
                    a == b
                }
            })
    }
}

impl std::fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.prefix, self.components.join("/"))
    }
}

/// Returns true if `path` lexically resolves inside `root`.
#[must_use]
pub fn is_within_root(path: &str, root: &Path) -> bool {
    let root_resolved = ResolvedPath::resolve(".", root);
    ResolvedPath::resolve(path, root).is_within(&root_resolved)
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || drive_prefix(path).is_some()
}

fn drive_prefix(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        Some(path[..2].to_string())
    } else {
        None
    }
}

/// `/d/Source/x` (one or more slashes after the drive) to `D:/Source/x`.
fn msys_to_drive(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    let mut chars = rest.chars();
    let drive = chars.next().filter(char::is_ascii_alphabetic)?;
    let after = chars.as_str();
    if !after.starts_with('/') {
        return None;
    }
    Some(format!(
        "{}:/{}",
        drive.to_ascii_uppercase(),
        after.trim_start_matches('/')
    ))
}

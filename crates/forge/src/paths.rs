//! Project-relative path handling.
//!
//! Every path the oracle names is interpreted relative to the project root and
//! normalized lexically. Paths that would leave the root, or reach into
//! forge's own state directory, are rejected.

use forge_core::config::STATE_DIR;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("path escapes the project root: {0}")]
    EscapesRoot(String),
    #[error("path is reserved for forge state: {0}")]
    Reserved(String),
}

/// Normalize `name` into a relative path inside the root.
///
/// Absolute paths are accepted only when they point inside `root`.
pub fn normalize(root: &Path, name: &str) -> Result<PathBuf, PathError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }

    let input = Path::new(trimmed);
    let relative = if input.is_absolute() {
        input
            .strip_prefix(root)
            .map_err(|_| PathError::EscapesRoot(trimmed.to_string()))?
    } else {
        input
    };

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(PathError::EscapesRoot(trimmed.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::EscapesRoot(trimmed.to_string()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    if is_reserved(&normalized) {
        return Err(PathError::Reserved(trimmed.to_string()));
    }
    Ok(normalized)
}

/// Whether a relative path lies in the state directory.
pub fn is_reserved(relative: &Path) -> bool {
    relative
        .components()
        .next()
        .is_some_and(|first| first.as_os_str() == STATE_DIR)
}

/// Absolute path for a project-relative name.
pub fn resolve(root: &Path, name: &str) -> Result<PathBuf, PathError> {
    normalize(root, name).map(|relative| root.join(relative))
}

/// Forward-slash display name of a relative path.
pub fn display_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Display name of `path` relative to `root`, if it is inside it.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root).ok().map(display_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_relative_components() {
        let root = Path::new("/work/app");
        assert_eq!(normalize(root, "src/./a.ts").unwrap(), PathBuf::from("src/a.ts"));
        assert_eq!(normalize(root, "src/lib/../a.ts").unwrap(), PathBuf::from("src/a.ts"));
        assert_eq!(normalize(root, "/work/app/src/a.ts").unwrap(), PathBuf::from("src/a.ts"));
    }

    #[test]
    fn rejects_escapes() {
        let root = Path::new("/work/app");
        assert!(matches!(normalize(root, "../secret"), Err(PathError::EscapesRoot(_))));
        assert!(matches!(normalize(root, "src/../../x"), Err(PathError::EscapesRoot(_))));
        assert!(matches!(normalize(root, "/etc/passwd"), Err(PathError::EscapesRoot(_))));
        assert_eq!(normalize(root, "  "), Err(PathError::Empty));
        assert_eq!(normalize(root, "src/.."), Err(PathError::Empty));
    }

    #[test]
    fn rejects_state_directory() {
        let root = Path::new("/work/app");
        for name in [".forge/task_history.tsv", "./.forge/config", "src/../.forge", "/work/app/.forge/x"] {
            assert!(matches!(normalize(root, name), Err(PathError::Reserved(_))), "{name}");
        }
        assert_eq!(normalize(root, "src/.forge/a.ts").unwrap(), PathBuf::from("src/.forge/a.ts"));
    }

    #[test]
    fn display_and_relative_names() {
        let root = Path::new("/work/app");
        assert_eq!(display_name(Path::new("src/components/Button.tsx")), "src/components/Button.tsx");
        assert_eq!(
            relative_name(root, Path::new("/work/app/src/a.ts")),
            Some("src/a.ts".to_string())
        );
        assert_eq!(relative_name(root, Path::new("/elsewhere/a.ts")), None);
        assert_eq!(resolve(root, "a.ts").unwrap(), PathBuf::from("/work/app/a.ts"));
    }
}

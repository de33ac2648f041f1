//! Capability sandbox: one root directory per session.
//!
//! Every path a tool touches goes through [`Sandbox::resolve`], which
//! guarantees the result lies under the canonical root, including through
//! symlinks. The file, search and shell operations live next to their tools
//! in `tools::builtin`.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::config::SandboxLimits;
use crate::tools::tool::ToolError;

/// Filesystem and process boundary for one worker.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    limits: SandboxLimits,
}

impl Sandbox {
    /// Create a sandbox rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>, limits: SandboxLimits) -> Result<Self, ToolError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            ToolError::ExecutionFailed(format!(
                "Cannot create sandbox root {}: {}",
                root.display(),
                e
            ))
        })?;
        let root = root.canonicalize().map_err(|e| {
            ToolError::ExecutionFailed(format!(
                "Cannot resolve sandbox root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root, limits })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Resolve `path_str` against the root.
    ///
    /// The existing part of the path is canonicalized (following symlinks);
    /// the non-existent tail is normalized lexically and re-appended. The
    /// result must start with the canonical root. Dangling symlinks are
    /// rejected because writing through them would land wherever they point.
    pub fn resolve(&self, path_str: &str) -> Result<PathBuf, ToolError> {
        let trimmed = path_str.trim();
        let requested = if trimmed.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(trimmed)
        };

        let joined = if requested.is_absolute() {
            requested
        } else {
            self.root.join(requested)
        };
        let normalized = normalize_lexical(&joined);

        let mut ancestor = normalized.as_path();
        let mut tail: Vec<OsString> = Vec::new();
        let resolved = loop {
            if ancestor.exists() {
                let canonical = ancestor
                    .canonicalize()
                    .map_err(|_| ToolError::PathEscape(path_str.to_string()))?;
                let mut result = canonical;
                for part in tail.iter().rev() {
                    result.push(part);
                }
                break result;
            }
            if ancestor.symlink_metadata().is_ok() {
                // exists() is false but the entry is there: a dangling symlink.
                return Err(ToolError::PathEscape(path_str.to_string()));
            }
            match (ancestor.file_name(), ancestor.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name.to_os_string());
                    ancestor = parent;
                }
                _ => return Err(ToolError::PathEscape(path_str.to_string())),
            }
        };

        if !resolved.starts_with(&self.root) {
            return Err(ToolError::PathEscape(path_str.to_string()));
        }
        Ok(resolved)
    }

    /// Path relative to the root for display, `.` for the root itself.
    pub fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the root is dropped, so the result never climbs above `/`.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("agentA");
        let sandbox = Sandbox::new(&root, SandboxLimits::default()).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn test_normalize_lexical() {
        assert_eq!(
            normalize_lexical(Path::new("/ws/agentA/../../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
        assert_eq!(
            normalize_lexical(Path::new("/ws/./a/b/../c")),
            PathBuf::from("/ws/a/c")
        );
        assert_eq!(normalize_lexical(Path::new("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn test_resolve_inside_root() {
        let (_dir, sb) = sandbox();
        assert_eq!(sb.resolve("notes.txt").unwrap(), sb.root().join("notes.txt"));
        assert_eq!(sb.resolve("").unwrap(), sb.root());
        assert_eq!(sb.resolve("a/../b/new.txt").unwrap(), sb.root().join("b/new.txt"));
    }

    #[test]
    fn test_resolve_rejects_parent_escape() {
        let (_dir, sb) = sandbox();
        let err = sb.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
        assert!(sb.resolve("../sibling/file.txt").is_err());
        assert!(sb.resolve("missing/../../../x").is_err());
    }

    #[test]
    fn test_resolve_absolute_paths() {
        let (_dir, sb) = sandbox();
        assert!(sb.resolve("/etc/passwd").is_err());
        let inside = sb.root().join("inside.txt");
        assert_eq!(sb.resolve(inside.to_str().unwrap()).unwrap(), inside);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (dir, sb) = sandbox();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(&outside, sb.root().join("link")).unwrap();

        assert!(matches!(
            sb.resolve("link/secret.txt"),
            Err(ToolError::PathEscape(_))
        ));
        assert!(sb.resolve("link/new_file.txt").is_err());
        assert!(sb.resolve("link").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_dangling_symlink() {
        let (dir, sb) = sandbox();
        let target = dir.path().join("not_yet_created.txt");
        std::os::unix::fs::symlink(&target, sb.root().join("dangling")).unwrap();

        assert!(matches!(
            sb.resolve("dangling"),
            Err(ToolError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_allows_internal_symlink() {
        let (_dir, sb) = sandbox();
        std::fs::create_dir_all(sb.root().join("real")).unwrap();
        std::os::unix::fs::symlink(sb.root().join("real"), sb.root().join("alias")).unwrap();

        assert_eq!(
            sb.resolve("alias/file.txt").unwrap(),
            sb.root().join("real/file.txt")
        );
    }

    #[test]
    fn test_display_path() {
        let (_dir, sb) = sandbox();
        assert_eq!(sb.display_path(sb.root()), ".");
        assert_eq!(sb.display_path(&sb.root().join("a/b.txt")), "a/b.txt");
    }
}

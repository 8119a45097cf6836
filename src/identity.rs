//! Script identities.
//!
//! A `ScriptId` is the key everything else is indexed by: the registry, the known-script set and
//! the reconciler's pid cache. It is always absolute and lexically normalized, so two spellings of
//! the same path compare equal without touching the filesystem.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// File name of the synthetic identity used for the interactive shell slot.
pub const SHELL_SLOT_NAME: &str = "__shell__";

/// Normalized absolute path naming a script (or the synthetic shell slot).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptId(PathBuf);

impl ScriptId {
    /// Builds an identity from any path, resolving relative paths against the current directory.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        Self(normalize_path(&absolute))
    }

    /// Builds an identity from a path that may be relative to `base`.
    pub fn resolve(base: &Path, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.is_absolute() {
            Self::new(path)
        } else {
            Self::new(base.join(path))
        }
    }

    /// The synthetic identity of the interactive shell slot for `scripts_dir`.
    pub fn shell_slot(scripts_dir: &Path) -> Self {
        Self::new(scripts_dir.join(SHELL_SLOT_NAME))
    }

    pub fn is_shell_slot(&self) -> bool {
        self.0.file_name().map(|name| name == SHELL_SLOT_NAME).unwrap_or(false)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name for display; falls back to the full path.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }

    /// Directory the script lives in.
    pub fn parent(&self) -> &Path {
        self.0.parent().unwrap_or(&self.0)
    }

    /// Ordering used when publishing script lists: case-insensitive file name, then full path.
    pub fn display_order(a: &ScriptId, b: &ScriptId) -> Ordering {
        a.file_name()
            .to_lowercase()
            .cmp(&b.file_name().to_lowercase())
            .then_with(|| a.0.cmp(&b.0))
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for ScriptId {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Collapses `.` and `..` components without consulting the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize_path(Path::new("/srv/scripts/./sub/../a.py")),
            PathBuf::from("/srv/scripts/a.py")
        );
        assert_eq!(normalize_path(Path::new("/../a.py")), PathBuf::from("/a.py"));
        assert_eq!(normalize_path(Path::new("x/../../y")), PathBuf::from("../y"));
    }

    #[test]
    fn identities_compare_by_normalized_path() {
        let a = ScriptId::new("/srv/scripts/a.py");
        let b = ScriptId::new("/srv/scripts/tools/../a.py");
        assert_eq!(a, b);
        assert_eq!(a.file_name(), "a.py");
        assert_eq!(a.parent(), Path::new("/srv/scripts"));
    }

    #[test]
    fn resolve_joins_relative_paths() {
        let base = Path::new("/srv/scripts");
        assert_eq!(
            ScriptId::resolve(base, "jobs/run.py"),
            ScriptId::new("/srv/scripts/jobs/run.py")
        );
        assert_eq!(ScriptId::resolve(base, "/opt/x.py"), ScriptId::new("/opt/x.py"));
    }

    #[test]
    fn shell_slot_is_recognizable() {
        let shell = ScriptId::shell_slot(Path::new("/srv/scripts"));
        assert!(shell.is_shell_slot());
        assert!(!ScriptId::new("/srv/scripts/a.py").is_shell_slot());
    }

    #[test]
    fn display_order_ignores_case() {
        let mut ids = vec![
            ScriptId::new("/s/beta.py"),
            ScriptId::new("/s/Alpha.py"),
            ScriptId::new("/s/alpha2.py"),
        ];
        ids.sort_by(ScriptId::display_order);
        let names: Vec<String> = ids.iter().map(ScriptId::file_name).collect();
        assert_eq!(names, vec!["Alpha.py", "alpha2.py", "beta.py"]);
    }
}

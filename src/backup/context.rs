//! Process-wide environment of the engine, built once and passed by reference.

use bon::Builder;
use getset::Getters;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// External binaries the engines can use. `None` means the tool is unavailable and the
/// in-process fallback is taken.
#[derive(Clone, Debug, Default, Builder, Getters)]
#[getset(get = "pub")]
pub struct ToolSet {
    tar: Option<PathBuf>,
    rsync: Option<PathBuf>,
    nice: Option<PathBuf>,
}

impl ToolSet {
    pub fn detect(search_path: Option<&OsStr>) -> Self {
        Self {
            tar: find_executable("tar", search_path),
            rsync: find_executable("rsync", search_path),
            nice: find_executable("nice", search_path),
        }
    }
}

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct AppContext {
    /// Staging area for remote archives, snapshots and restore downloads
    #[builder(into)]
    temp_dir: PathBuf,
    /// `PATH` handed to child processes
    search_path: Option<OsString>,
    #[builder(default)]
    tools: ToolSet,
}

impl AppContext {
    pub fn from_env() -> Self {
        let search_path = std::env::var_os("PATH");
        let tools = ToolSet::detect(search_path.as_deref());
        Self {
            temp_dir: std::env::temp_dir(),
            search_path,
            tools,
        }
    }

    /// Like [`AppContext::from_env`] but staging under `temp_dir`.
    pub fn with_temp_dir<P: Into<PathBuf>>(temp_dir: P) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            ..Self::from_env()
        }
    }

    pub fn find_executable(&self, name: &str) -> Option<PathBuf> {
        find_executable(name, self.search_path.as_deref())
    }
}

/// Looks `name` up in `search_path` only; without a search path nothing is found.
pub fn find_executable(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let search_path = search_path?;
    let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
    match which::which_in(name, Some(search_path), cwd) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::debug!("{} not found on the search path: {}", name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_find_executable_in_search_path() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let tool = temp_dir.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let not_exec = temp_dir.path().join("plain");
        std::fs::write(&not_exec, "").unwrap();

        let search_path = std::env::join_paths([temp_dir.path()]).unwrap();
        assert_eq!(find_executable("mytool", Some(&search_path)), Some(tool));
        assert_eq!(find_executable("plain", Some(&search_path)), None);
        assert_eq!(find_executable("missing", Some(&search_path)), None);
        assert_eq!(find_executable("mytool", None), None);
    }

    #[test]
    fn test_builder_without_tools() {
        let temp_dir = TempDir::new().unwrap();
        let context = AppContext::builder().temp_dir(temp_dir.path()).build();
        assert!(context.tools().tar().is_none());
        assert!(context.search_path().is_none());
        assert_eq!(context.temp_dir(), temp_dir.path());
    }
}

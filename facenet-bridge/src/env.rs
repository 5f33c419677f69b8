//! Isolated Python environment provisioning.
//!
//! A worker must only ever see the interpreter and packages of its own
//! virtual environment. Provisioning sets `VIRTUAL_ENV` to the environment
//! root, puts the environment's executable directory at the front of `PATH`
//! and clears `PYTHONHOME`, which would otherwise redirect the interpreter to
//! a system-wide prefix.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Variable that names the active virtual environment.
pub const ACTIVE_ENV_VAR: &str = "VIRTUAL_ENV";

/// Executable search path variable.
pub const SEARCH_PATH_VAR: &str = "PATH";

/// Home-directory override that must not reach the worker.
pub const HOME_OVERRIDE_VAR: &str = "PYTHONHOME";

/// Directory under the module root that holds the virtual environment.
pub const ENV_DIR_NAME: &str = "python3";

#[cfg(windows)]
const BIN_DIR_NAME: &str = "Scripts";
#[cfg(not(windows))]
const BIN_DIR_NAME: &str = "bin";

/// An isolated Python environment rooted at a fixed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedEnv {
    root: PathBuf,
}

impl IsolatedEnv {
    /// Use `root` as the environment root. The path is made absolute and
    /// normalised lexically.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let absolute = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            root: normalize(&absolute),
        }
    }

    /// The environment that lives in `<module_root>/python3`.
    pub fn for_module_root(module_root: impl AsRef<Path>) -> Self {
        Self::new(module_root.as_ref().join(ENV_DIR_NAME))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the environment's executables.
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join(BIN_DIR_NAME)
    }

    /// Fail with [`BridgeError::EnvironmentNotFound`] unless the root is a directory.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(BridgeError::EnvironmentNotFound(self.root.clone()))
        }
    }

    /// `current` with the executable directory moved to the front.
    ///
    /// An existing entry for the directory is dropped rather than repeated,
    /// so applying this to its own output returns the same value.
    pub fn search_path(&self, current: Option<&OsStr>) -> Result<OsString> {
        let bin = self.bin_dir();
        let mut entries = vec![bin.clone()];
        if let Some(current) = current {
            entries.extend(
                std::env::split_paths(current)
                    .filter(|p| !p.as_os_str().is_empty() && normalize(p) != bin),
            );
        }
        std::env::join_paths(entries).map_err(|e| BridgeError::EnvironmentInvalid(e.to_string()))
    }

    /// Activate the environment for the current process.
    pub fn activate(&self) -> Result<()> {
        self.ensure_exists()?;
        let search_path = self.search_path(std::env::var_os(SEARCH_PATH_VAR).as_deref())?;

        std::env::set_var(ACTIVE_ENV_VAR, &self.root);
        std::env::set_var(SEARCH_PATH_VAR, search_path);
        std::env::remove_var(HOME_OVERRIDE_VAR);

        info!(root = %self.root.display(), "Activated isolated environment");
        Ok(())
    }

    /// Activate the environment for a child command only.
    pub fn apply_to(&self, command: &mut Command) -> Result<()> {
        self.ensure_exists()?;
        let search_path = self.search_path(std::env::var_os(SEARCH_PATH_VAR).as_deref())?;

        command
            .env(ACTIVE_ENV_VAR, &self.root)
            .env(SEARCH_PATH_VAR, search_path)
            .env_remove(HOME_OVERRIDE_VAR);

        debug!(root = %self.root.display(), "Applied isolated environment to worker command");
        Ok(())
    }

    /// Resolve a bare program name such as `python3` against the
    /// environment's executable directory. Anything else is returned as is.
    pub fn resolve_program(&self, program: &Path) -> PathBuf {
        let mut components = program.components();
        let bare = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !bare {
            return program.to_path_buf();
        }

        let bin = self.bin_dir();
        let candidates = [
            bin.join(program),
            bin.join(format!("{}{}", program.display(), std::env::consts::EXE_SUFFIX)),
        ];
        candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| program.to_path_buf())
    }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

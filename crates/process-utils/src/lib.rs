//! Process-related helpers shared across the workspace.
//!
//! Spawning helpers apply the Windows `CREATE_NO_WINDOW` flag, and
//! [`resolve_executable`] locates media tools in trusted install locations.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Directories searched before falling back to `PATH`.
pub const TRUSTED_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];

/// Failure to locate an executable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// An explicitly configured path is missing, not a regular file, or not executable.
    #[error("invalid executable path: {0}")]
    InvalidPath(PathBuf),
    /// Nothing matching the tool name was found in the trusted dirs or on `PATH`.
    #[error("{0} executable not found")]
    NotFound(String),
}

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Whether `path` is an existing regular file the current user may execute.
pub fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolve the executable for `tool`.
///
/// An explicit path wins and must be an executable regular file. Otherwise
/// [`TRUSTED_DIRS`] are searched in order, then every entry of `PATH`.
pub fn resolve_executable(tool: &str, explicit: Option<&Path>) -> Result<PathBuf, ResolveError> {
    if let Some(path) = explicit {
        if is_executable_file(path) {
            return Ok(path.to_path_buf());
        }
        return Err(ResolveError::InvalidPath(path.to_path_buf()));
    }

    let file_name = executable_name(tool);

    for dir in TRUSTED_DIRS {
        let candidate = Path::new(dir).join(&file_name);
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }

    search_path(&file_name).ok_or_else(|| ResolveError::NotFound(tool.to_string()))
}

fn search_path(file_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(file_name))
        .find(|candidate| is_executable_file(candidate))
}

fn executable_name(tool: &str) -> String {
    if cfg!(windows) && !tool.to_ascii_lowercase().ends_with(".exe") {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

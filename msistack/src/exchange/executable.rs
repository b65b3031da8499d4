use std::env;
use std::path::{Path, PathBuf};

use log::debug;

use msicore::error::{MsiError, Result};

/// Name of the alignment engine executable.
pub const ALIGNMENT_ENGINE: &str = "elastix";
/// Name of the warp engine executable.
pub const WARP_ENGINE: &str = "transformix";

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locate an executable, looking in `additional` (and its `bin` folder) before `PATH`.
///
/// # Arguments
///
/// * `name` - executable name without platform suffix
/// * `additional` - optional directory searched first
///
/// # Returns
///
/// The full path of the first match, or `ExecutableNotFound`
pub fn find_executable(name: &str, additional: Option<&Path>) -> Result<PathBuf> {
    let file_name = format!("{}{}", name, env::consts::EXE_SUFFIX);

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = additional {
        candidates.push(dir.to_path_buf());
        candidates.push(dir.join("bin"));
    }
    if let Some(paths) = env::var_os("PATH") {
        candidates.extend(env::split_paths(&paths));
    }

    for dir in candidates {
        let candidate = dir.join(&file_name);
        if is_executable(&candidate) {
            debug!("Resolved {} to {}", name, candidate.display());
            return Ok(candidate);
        }
    }
    Err(MsiError::ExecutableNotFound(name.to_string()))
}

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};

use msicore::error::Result;

/// Scoped working directory for one engine run.
///
/// A temporary directory is created when no external directory is configured; an external
/// directory is created if absent. On drop the directory is removed if configured to do
/// so; removal failures are logged and never propagated.
#[derive(Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
    remove_on_drop: bool,
}

impl WorkingDirectory {
    pub fn create(external: Option<&Path>, remove_on_drop: bool) -> Result<Self> {
        let path = match external {
            Some(dir) => {
                if !dir.exists() {
                    fs::create_dir_all(dir)?;
                }
                info!("Use external working directory: {}", dir.display());
                dir.to_path_buf()
            }
            None => {
                let dir = tempfile::Builder::new().prefix("msistack-").tempdir()?.keep();
                info!("Create working directory: {}", dir.display());
                dir
            }
        };
        Ok(WorkingDirectory { path, remove_on_drop })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn removes_on_drop(&self) -> bool {
        self.remove_on_drop
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        if !self.remove_on_drop || !self.path.is_dir() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            error!("Cleanup of working directory {} failed: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_directory_is_removed() {
        let path = {
            let dir = WorkingDirectory::create(None, true).unwrap();
            fs::write(dir.join("fixed.nrrd"), b"x").unwrap();
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_removal_follows_configuration() {
        let root = tempfile::tempdir().unwrap();
        let external = root.path().join("work");
        let path = {
            let dir = WorkingDirectory::create(Some(&external), true).unwrap();
            assert!(dir.removes_on_drop());
            dir.path().to_path_buf()
        };
        assert!(!path.exists());

        let dir = WorkingDirectory::create(None, false).unwrap();
        assert!(!dir.removes_on_drop());
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(path.is_dir());
        fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn test_kept_external_directory() {
        let root = tempfile::tempdir().unwrap();
        let external = root.path().join("nested").join("work");
        {
            let dir = WorkingDirectory::create(Some(&external), false).unwrap();
            assert_eq!(dir.path(), external.as_path());
        }
        assert!(external.is_dir());
    }
}

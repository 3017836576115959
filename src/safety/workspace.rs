/// Per-run scratch directories
/// Every run gets `<scratch_root>/<run_id>` holding its source file; nothing is
/// shared between runs and the directory is removed at teardown.
use crate::config::config::RunAs;
use crate::config::types::{Result, SandboxError};
use crate::safety::safe_cleanup;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Scratch directory owned by one run
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    source_file: PathBuf,
    /// Set once removed or deliberately kept; Drop does nothing afterwards
    settled: bool,
}

impl Workspace {
    fn create(
        base_dir: &Path,
        run_id: &str,
        source_name: &str,
        source: &[u8],
        owner: Option<RunAs>,
    ) -> Result<Self> {
        let run_dir = base_dir.join(run_id);

        fs::DirBuilder::new()
            .mode(0o700)
            .create(&run_dir)
            .map_err(|e| {
                SandboxError::Filesystem(format!(
                    "Failed to create workspace directory {}: {}",
                    run_dir.display(),
                    e
                ))
            })?;

        let mut workspace = Self {
            run_id: run_id.to_string(),
            source_file: run_dir.join(source_name),
            run_dir,
            settled: false,
        };
        workspace.write_source(source)?;

        if let Some(owner) = owner {
            let uid = Some(nix::unistd::Uid::from_raw(owner.uid));
            let gid = Some(nix::unistd::Gid::from_raw(owner.gid));
            for path in [&workspace.run_dir, &workspace.source_file] {
                nix::unistd::chown(path, uid, gid).map_err(|e| {
                    SandboxError::Filesystem(format!("chown {} failed: {}", path.display(), e))
                })?;
            }
        }

        Ok(workspace)
    }

    fn write_source(&mut self, source: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.source_file)
            .map_err(|e| {
                SandboxError::Filesystem(format!(
                    "Failed to create source file {}: {}",
                    self.source_file.display(),
                    e
                ))
            })?;
        file.write_all(source)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    /// Remove the directory tree (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.settled {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.run_dir)?;
        self.settled = true;
        Ok(())
    }

    /// Leave the directory on disk, e.g. while processes may still use it
    pub fn retain(&mut self) {
        if !self.settled {
            log::warn!("Retaining workspace {} for inspection", self.run_dir.display());
        }
        self.settled = true;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("Failed to remove workspace {}: {}", self.run_dir.display(), e);
        }
    }
}

/// Owns the scratch root and hands out per-run workspaces
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o711)
            .create(&base_dir)
            .map_err(|e| {
                SandboxError::Filesystem(format!(
                    "Failed to create scratch root {}: {}",
                    base_dir.display(),
                    e
                ))
            })?;

        let meta = fs::symlink_metadata(&base_dir)?;
        if !meta.is_dir() {
            return Err(SandboxError::Filesystem(format!(
                "scratch root {} is not a directory",
                base_dir.display()
            )));
        }
        if meta.permissions().mode() & 0o022 != 0 {
            return Err(SandboxError::Filesystem(format!(
                "scratch root {} is group/world writable",
                base_dir.display()
            )));
        }

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(
        &self,
        run_id: &str,
        source_name: &str,
        source: &[u8],
        owner: Option<RunAs>,
    ) -> Result<Workspace> {
        Workspace::create(&self.base_dir, run_id, source_name, source, owner)
    }

    /// Remove run directories older than `max_age`, e.g. left behind by a crash
    pub fn cleanup_old_workspaces(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();

        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            SandboxError::Filesystem(format!(
                "Failed to read scratch root {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Failed to get metadata for {}: {}", path.display(), e);
                    continue;
                }
            };
            if !metadata.is_dir() {
                continue;
            }

            let age = match metadata.modified().ok().and_then(|m| now.duration_since(m).ok()) {
                Some(age) => age,
                None => continue,
            };

            if age >= max_age {
                log::info!("Cleaning up stale workspace: {}", path.display());
                match safe_cleanup::remove_tree_secure(&path) {
                    Ok(()) => cleaned += 1,
                    Err(e) => log::warn!("Failed to remove stale workspace {}: {}", path.display(), e),
                }
            }
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let temp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("scratch")).unwrap();
        (temp, manager)
    }

    #[test]
    fn test_workspace_holds_source() {
        let (_temp, manager) = manager();
        let mut workspace = manager
            .create_workspace("run-1", "main.py", b"print(1)", None)
            .unwrap();

        assert!(workspace.run_dir().exists());
        assert_eq!(fs::read(workspace.source_file()).unwrap(), b"print(1)");
        let mode = fs::metadata(workspace.run_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        workspace.cleanup().unwrap();
        assert!(!workspace.run_dir().exists());
        workspace.cleanup().unwrap();
    }

    #[test]
    fn test_duplicate_run_id_rejected() {
        let (_temp, manager) = manager();
        let _first = manager.create_workspace("run-2", "main.py", b"", None).unwrap();
        assert!(manager.create_workspace("run-2", "main.py", b"", None).is_err());
    }

    #[test]
    fn test_drop_removes_unless_retained() {
        let (_temp, manager) = manager();
        let dropped = manager.create_workspace("run-3", "main.py", b"", None).unwrap();
        let dropped_dir = dropped.run_dir().to_path_buf();
        drop(dropped);
        assert!(!dropped_dir.exists());

        let mut kept = manager.create_workspace("run-4", "main.py", b"", None).unwrap();
        kept.retain();
        let kept_dir = kept.run_dir().to_path_buf();
        drop(kept);
        assert!(kept_dir.exists());
    }

    #[test]
    fn test_cleanup_old_workspaces() {
        let (_temp, manager) = manager();
        let mut workspace = manager.create_workspace("run-5", "main.py", b"", None).unwrap();
        workspace.retain();

        assert_eq!(manager.cleanup_old_workspaces(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(manager.cleanup_old_workspaces(Duration::ZERO).unwrap(), 1);
        assert!(!workspace.run_dir().exists());
    }
}

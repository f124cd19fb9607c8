//! Backup and restore of filesystem state for a single generation run.
//!
//! The manager records two things while a run is in progress: backups
//! (original path -> copy taken before it was touched) and temp dirs
//! (paths the run created and that must simply disappear on failure).
//! [`RollbackManager::rollback`] deletes the temp dirs first and then
//! restores every backup, carrying on past failures and reporting all of
//! them at the end together with the shell commands that would finish the
//! job by hand.

use crate::errors::{GenerationError, aggregate_errors};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Default)]
struct RollbackState {
    backups: BTreeMap<PathBuf, PathBuf>,
    temp_dirs: Vec<PathBuf>,
    seq: u64,
}

pub struct RollbackManager {
    backup_root: PathBuf,
    state: Mutex<RollbackState>,
}

impl RollbackManager {
    /// Backups are written under `backup_root`, which is created on demand.
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            state: Mutex::new(RollbackState::default()),
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Snapshots the whole output directory before generation starts.
    /// Does nothing if it does not exist yet.
    pub fn create_automatic_backup(&self, output_dir: &Path) -> Result<Option<PathBuf>, GenerationError> {
        let backup = self.create_backup(output_dir)?;
        if let Some(backup) = &backup {
            info!("Automatic backup of {} at {}", output_dir.display(), backup.display());
        }
        Ok(backup)
    }

    /// Copies `path` (file or directory tree) into the backup root and
    /// registers it. Does nothing if `path` does not exist.
    pub fn create_backup(&self, path: &Path) -> Result<Option<PathBuf>, GenerationError> {
        let original = absolute(path)?;
        if !original.exists() {
            debug!("Nothing to back up at {}", original.display());
            return Ok(None);
        }

        let backup = self.next_backup_path(&original);
        copy_tree(&original, &backup).map_err(|e| {
            GenerationError::file_system(
                format!("failed to back up {} to {}", original.display(), backup.display()),
                e,
            )
        })?;

        debug!("Backed up {} to {}", original.display(), backup.display());
        self.register_backup(&original, &backup);
        Ok(Some(backup))
    }

    /// Records an existing backup. Re-registering a path replaces the
    /// previous backup.
    pub fn register_backup(&self, original: &Path, backup: &Path) {
        let mut state = self.state.lock();
        if let Some(previous) = state
            .backups
            .insert(original.to_path_buf(), backup.to_path_buf())
        {
            debug!("Replaced backup {} for {}", previous.display(), original.display());
        }
    }

    /// Records a directory to delete, not restore, on rollback.
    pub fn register_temp_dir(&self, path: &Path) {
        let mut state = self.state.lock();
        if !state.temp_dirs.iter().any(|p| p == path) {
            state.temp_dirs.push(path.to_path_buf());
        }
    }

    /// Deletes temp dirs, then restores backups.
    ///
    /// Registrations that were handled are dropped; the ones that failed
    /// stay registered and are described in the returned error. A
    /// cancelled token stops further work and reports what is left.
    pub fn rollback(&self, cancel: &CancellationToken) -> Result<(), GenerationError> {
        let (temp_dirs, backups) = {
            let state = self.state.lock();
            (state.temp_dirs.clone(), state.backups.clone())
        };
        info!(
            "Rolling back: {} temp dir(s), {} backup(s)",
            temp_dirs.len(),
            backups.len()
        );

        let mut errors = self.delete_temp_dirs(&temp_dirs, cancel);

        for (original, backup) in &backups {
            let outcome = if cancel.is_cancelled() {
                Err(io::Error::new(io::ErrorKind::Interrupted, "rollback cancelled"))
            } else {
                restore(original, backup)
            };
            match outcome {
                Ok(()) => {
                    info!("Restored {} from {}", original.display(), backup.display());
                    self.state.lock().backups.remove(original);
                }
                Err(e) => {
                    warn!("Could not restore {}: {}", original.display(), e);
                    errors.push(
                        GenerationError::file_system(format!("failed to restore {}", original.display()), e)
                            .with_suggestion(format!(
                                "mv {} {}",
                                backup.display(),
                                original.display()
                            )),
                    );
                }
            }
        }

        match aggregate_errors(errors) {
            Some(err) => Err(err),
            None => {
                self.clear();
                Ok(())
            }
        }
    }

    /// Deletes registered temp dirs only; backups are left alone.
    pub fn cleanup_temp_dirs(&self) -> Result<(), GenerationError> {
        let temp_dirs = self.state.lock().temp_dirs.clone();
        let errors = self.delete_temp_dirs(&temp_dirs, &CancellationToken::new());
        aggregate_errors(errors).map_or(Ok(()), Err)
    }

    /// Forgets every registration. Backup copies stay on disk.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.backups.clear();
        state.temp_dirs.clear();
    }

    /// Backup copies under the backup root, oldest first.
    pub fn stored_backups(&self) -> Result<Vec<PathBuf>, GenerationError> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GenerationError::file_system(
                    format!("cannot list {}", self.backup_root.display()),
                    e,
                ));
            }
        };
        // Names start with a fixed-width timestamp.
        let mut copies: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .map(|entry| entry.path())
            .collect();
        copies.sort();
        Ok(copies)
    }

    /// Deletes all but the newest `keep` backup copies. Copies still
    /// registered here are never removed. Returns how many were deleted.
    pub fn prune_backups(&self, keep: usize) -> Result<usize, GenerationError> {
        let in_use: Vec<PathBuf> = self.state.lock().backups.values().cloned().collect();
        let copies: Vec<PathBuf> = self
            .stored_backups()?
            .into_iter()
            .filter(|copy| !in_use.contains(copy))
            .collect();
        let excess = copies.len().saturating_sub(keep);

        let mut removed = 0;
        let mut errors = Vec::new();
        for copy in &copies[..excess] {
            match remove_path(copy) {
                Ok(()) => {
                    debug!("Pruned backup {}", copy.display());
                    removed += 1;
                }
                Err(e) => errors.push(
                    GenerationError::file_system(format!("failed to prune {}", copy.display()), e)
                        .with_suggestion(format!("rm -rf {}", copy.display())),
                ),
            }
        }
        if removed > 0 {
            info!("Pruned {} old backup(s) from {}", removed, self.backup_root.display());
        }
        aggregate_errors(errors).map_or(Ok(removed), Err)
    }

    pub fn has_backups(&self) -> bool {
        !self.state.lock().backups.is_empty()
    }

    pub fn has_temp_dirs(&self) -> bool {
        !self.state.lock().temp_dirs.is_empty()
    }

    pub fn backup_count(&self) -> usize {
        self.state.lock().backups.len()
    }

    pub fn temp_dir_count(&self) -> usize {
        self.state.lock().temp_dirs.len()
    }

    /// Registered (original, backup) pairs.
    pub fn backups(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state
            .lock()
            .backups
            .iter()
            .map(|(o, b)| (o.clone(), b.clone()))
            .collect()
    }

    fn delete_temp_dirs(&self, dirs: &[PathBuf], cancel: &CancellationToken) -> Vec<GenerationError> {
        let mut errors = Vec::new();
        for dir in dirs {
            let outcome = if cancel.is_cancelled() {
                Err(io::Error::new(io::ErrorKind::Interrupted, "rollback cancelled"))
            } else {
                remove_path(dir)
            };
            match outcome {
                Ok(()) => {
                    debug!("Removed temp dir {}", dir.display());
                    self.state.lock().temp_dirs.retain(|p| p != dir);
                }
                Err(e) => {
                    warn!("Could not remove {}: {}", dir.display(), e);
                    errors.push(
                        GenerationError::file_system(format!("failed to remove {}", dir.display()), e)
                            .with_suggestion(format!("rm -rf {}", dir.display())),
                    );
                }
            }
        }
        errors
    }

    fn next_backup_path(&self, original: &Path) -> PathBuf {
        let seq = {
            let mut state = self.state.lock();
            state.seq += 1;
            state.seq
        };
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        self.backup_root.join(format!(
            "{}-{:04}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            seq,
            name
        ))
    }
}

fn absolute(path: &Path) -> Result<PathBuf, GenerationError> {
    std::path::absolute(path).map_err(|e| {
        GenerationError::file_system(format!("cannot resolve {}", path.display()), e)
    })
}

/// Copies a file or a directory tree. Symlinks are recreated, not followed.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if !fs::symlink_metadata(src)?.is_dir() {
        fs::copy(src, dst)?;
        return Ok(());
    }

    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Removes a file or directory; a path that is already gone is fine.
fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn restore(original: &Path, backup: &Path) -> io::Result<()> {
    if !backup.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("backup {} is missing", backup.display()),
        ));
    }
    remove_path(original)?;
    if let Some(parent) = original.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(backup, original).is_err() {
        // Backup root may be on another filesystem.
        copy_tree(backup, original)?;
        remove_path(backup)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> RollbackManager {
        RollbackManager::new(dir.path().join("backups"))
    }

    #[test]
    fn test_rollback_restores_backup_and_removes_temp_dir() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.txt");
        let backup = dir.path().join("b.txt");
        let temp = dir.path().join("tmp");
        fs::write(&original, "partial output").unwrap();
        fs::write(&backup, "before the run").unwrap();
        fs::create_dir_all(temp.join("nested")).unwrap();

        let rollback = manager(&dir);
        rollback.register_backup(&original, &backup);
        rollback.register_temp_dir(&temp);
        rollback.rollback(&CancellationToken::new()).unwrap();

        assert!(!temp.exists());
        assert_eq!(fs::read_to_string(&original).unwrap(), "before the run");
        assert!(!rollback.has_backups());
        assert!(!rollback.has_temp_dirs());
    }

    #[test]
    fn test_backup_of_missing_path_is_noop() {
        let dir = TempDir::new().unwrap();
        let rollback = manager(&dir);

        assert!(rollback.create_backup(&dir.path().join("nope")).unwrap().is_none());
        assert!(
            rollback
                .create_automatic_backup(&dir.path().join("project"))
                .unwrap()
                .is_none()
        );
        assert!(!rollback.has_backups());
    }

    #[test]
    fn test_automatic_backup_restores_whole_tree() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(project.join("docs")).unwrap();
        fs::write(project.join("existing.txt"), "keep me").unwrap();
        fs::write(project.join("docs/notes.md"), "notes").unwrap();

        let rollback = manager(&dir);
        let backup = rollback.create_automatic_backup(&project).unwrap().unwrap();
        assert!(backup.starts_with(rollback.backup_root()));
        assert!(backup.join("docs/notes.md").is_file());

        fs::remove_file(project.join("existing.txt")).unwrap();
        fs::create_dir_all(project.join("api")).unwrap();
        fs::write(project.join("api/main.go"), "package main").unwrap();

        rollback.rollback(&CancellationToken::new()).unwrap();
        assert_eq!(fs::read_to_string(project.join("existing.txt")).unwrap(), "keep me");
        assert_eq!(fs::read_to_string(project.join("docs/notes.md")).unwrap(), "notes");
        assert!(!project.join("api").exists());
        assert!(!backup.exists());
    }

    #[test]
    fn test_reregistering_replaces_backup() {
        let dir = TempDir::new().unwrap();
        let rollback = manager(&dir);
        let original = dir.path().join("a");
        rollback.register_backup(&original, &dir.path().join("b1"));
        rollback.register_backup(&original, &dir.path().join("b2"));

        assert_eq!(rollback.backup_count(), 1);
        assert_eq!(rollback.backups()[0].1, dir.path().join("b2"));
    }

    #[test]
    fn test_missing_temp_dir_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let rollback = manager(&dir);
        rollback.register_temp_dir(&dir.path().join("never-created"));
        rollback.register_temp_dir(&dir.path().join("never-created"));
        assert_eq!(rollback.temp_dir_count(), 1);

        rollback.rollback(&CancellationToken::new()).unwrap();
        assert!(!rollback.has_temp_dirs());
    }

    #[test]
    fn test_failures_are_accumulated_with_manual_commands() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp");
        fs::create_dir_all(&temp).unwrap();
        let rollback = manager(&dir);
        rollback.register_backup(&dir.path().join("x"), &dir.path().join("gone-x"));
        rollback.register_backup(&dir.path().join("y"), &dir.path().join("gone-y"));
        rollback.register_temp_dir(&temp);

        let err = rollback.rollback(&CancellationToken::new()).unwrap_err();

        assert_eq!(err.category(), ErrorCategory::FileSystem);
        assert!(err.message().contains("multiple errors occurred (2)"));
        let commands: Vec<&String> = err
            .suggestions()
            .iter()
            .filter(|s| s.starts_with("mv "))
            .collect();
        assert_eq!(commands.len(), 2);
        assert!(!temp.exists());
        assert!(!rollback.has_temp_dirs());
        assert_eq!(rollback.backup_count(), 2);
    }

    #[test]
    fn test_cancelled_rollback_reports_remaining_work() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp");
        fs::create_dir_all(&temp).unwrap();
        let rollback = manager(&dir);
        rollback.register_temp_dir(&temp);

        let token = CancellationToken::new();
        token.cancel();
        let err = rollback.rollback(&token).unwrap_err();

        assert!(temp.exists());
        assert!(err.suggestions().iter().any(|s| s.starts_with("rm -rf ")));
        assert!(rollback.has_temp_dirs());
    }

    #[test]
    fn test_cleanup_temp_dirs_keeps_backups() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp");
        fs::create_dir_all(&temp).unwrap();
        let original = dir.path().join("keep.txt");
        fs::write(&original, "v1").unwrap();

        let rollback = manager(&dir);
        rollback.create_backup(&original).unwrap();
        rollback.register_temp_dir(&temp);
        rollback.cleanup_temp_dirs().unwrap();

        assert!(!temp.exists());
        assert!(!rollback.has_temp_dirs());
        assert!(rollback.has_backups());
    }

    #[test]
    fn test_clear_leaves_filesystem_untouched() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("keep.txt");
        fs::write(&original, "v1").unwrap();
        let rollback = manager(&dir);
        let backup = rollback.create_backup(&original).unwrap().unwrap();

        rollback.clear();
        assert!(!rollback.has_backups());
        assert!(backup.exists());
        assert!(original.exists());
    }

    #[test]
    fn test_prune_keeps_newest_and_registered_copies() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("keep.txt");
        fs::write(&original, "v1").unwrap();
        let rollback = manager(&dir);

        let mut copies = Vec::new();
        for _ in 0..3 {
            copies.push(rollback.create_backup(&original).unwrap().unwrap());
            rollback.clear();
        }
        let in_flight = rollback.create_backup(&original).unwrap().unwrap();

        assert_eq!(rollback.prune_backups(1).unwrap(), 2);
        assert!(!copies[0].exists());
        assert!(!copies[1].exists());
        assert!(copies[2].exists());
        assert!(in_flight.exists());
        assert_eq!(rollback.stored_backups().unwrap(), vec![copies[2].clone(), in_flight]);
    }

    #[test]
    fn test_prune_without_backup_root_is_noop() {
        let dir = TempDir::new().unwrap();
        assert_eq!(manager(&dir).prune_backups(0).unwrap(), 0);
    }
}

//! Restore engine
//!
//! Restoring drives the same change-comparison logic as backup, in the
//! opposite direction: each visited node's state is resolved at the target
//! backup, compared against the live filesystem entry with the change
//! detector, and only the differing aspects are applied — content from the
//! repository (or the embedded digest bytes), then permissions, ownership
//! and modification times. A resolved `NonExisting` state removes the live
//! entry; a kind mismatch replaces it wholesale.
//!
//! Resolution is forward: the first history point whose backup id is not
//! older than the target is the answer. A path with no satisfying point has
//! no defined state at that time — fatal for the requested path, treated as
//! `NonExisting` below it. Recursion into subnodes is gated on the
//! *resolved* state being a directory, never on the node's most-current
//! state.

use crate::detect;
use crate::error::{KeepsakeError, Result};
use crate::hint::{ChangeFlag, HintStatus};
use crate::storage::Repository;
use crate::tree::{Catalog, PathNode};
use crate::types::{BackupId, PathState, RegularFileInfo, RestoreReport};
use crate::utils;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Restore a tracked path (and everything below it) to a target backup
///
/// # Errors
///
/// - [`KeepsakeError::PathNotTracked`] if the catalog does not know `path`
/// - [`KeepsakeError::NoStateAtBackup`] if the path has no defined state at
///   the target backup
/// - repository and filesystem errors while applying states
pub fn restore_path(
    catalog: &Catalog,
    repo: &Repository,
    path: &Path,
    target: BackupId,
) -> Result<RestoreReport> {
    let node = catalog
        .node(path)
        .ok_or_else(|| KeepsakeError::PathNotTracked(path.to_path_buf()))?;

    // resolution failure is fatal for the requested path itself
    if node.resolve(target).is_none() {
        return Err(KeepsakeError::NoStateAtBackup {
            path: path.to_path_buf(),
            backup: target,
        });
    }

    info!("Restoring {:?} to backup {}", path, target);
    let mut report = RestoreReport::default();
    restore_node(repo, node, target, &mut report)?;
    info!(
        "Restored {:?}: {} files, {} directories, {} symlinks, {} removed ({})",
        path,
        report.files_restored,
        report.directories_restored,
        report.symlinks_restored,
        report.entries_removed,
        utils::format_bytes(report.bytes_written)
    );
    Ok(report)
}

fn restore_node(
    repo: &Repository,
    node: &PathNode,
    target: BackupId,
    report: &mut RestoreReport,
) -> Result<()> {
    // below the requested path an unresolvable node simply did not exist
    let state = match node.resolve(target) {
        Some(point) => point.state.clone(),
        None => PathState::NonExisting,
    };

    apply_state(repo, &node.path, &state, report)?;

    if let PathState::Directory { modified, .. } = &state {
        for sub in &node.subnodes {
            restore_node(repo, sub, target, report)?;
        }
        // restoring children bumped the directory's mtime; put it back last
        utils::set_modified(&node.path, *modified)?;
    }
    Ok(())
}

/// Bring one live entry in line with a resolved historical state
fn apply_state(
    repo: &Repository,
    path: &Path,
    state: &PathState,
    report: &mut RestoreReport,
) -> Result<()> {
    let live = match fs::symlink_metadata(path) {
        Ok(_) => Some(utils::file_stat(path)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(KeepsakeError::path_io(path, e)),
    };

    match (state, live) {
        (PathState::NonExisting, None) => {
            report.entries_unchanged += 1;
        }
        (PathState::NonExisting, Some(stat)) => {
            remove_entry(path, stat.kind == crate::types::PathKind::Directory)?;
            report.entries_removed += 1;
            debug!("Removed {:?}", path);
        }
        (state, None) => {
            create_entry(repo, path, state, report)?;
        }
        (state, Some(stat)) => {
            if state.kind() != Some(stat.kind) {
                // the entry kind changed since the snapshot; replace it
                remove_entry(path, stat.kind == crate::types::PathKind::Directory)?;
                create_entry(repo, path, state, report)?;
            } else {
                let detection = detect::detect(path, state, &stat)?;
                apply_differences(repo, path, state, detection.hint, report)?;
            }
        }
    }
    Ok(())
}

/// Apply only the aspects the detector flagged as differing
fn apply_differences(
    repo: &Repository,
    path: &Path,
    state: &PathState,
    hint: crate::hint::Hint,
    report: &mut RestoreReport,
) -> Result<()> {
    if hint.status() == HintStatus::Unchanged {
        report.entries_unchanged += 1;
        return Ok(());
    }

    match state {
        PathState::Regular { owner, info } => {
            if hint.needs_content() {
                write_file_content(repo, path, info)?;
                report.bytes_written += info.size;
            }
            if hint.has_change(ChangeFlag::PermissionsChanged) {
                utils::set_permissions(path, info.mode)?;
            }
            if hint.has_change(ChangeFlag::OwnerChanged) {
                apply_owner(path, *owner);
            }
            if hint.has_change(ChangeFlag::TimestampChanged) || hint.needs_content() {
                utils::set_modified(path, info.modified)?;
            }
            report.files_restored += 1;
        }
        PathState::Symlink { owner, target } => {
            if hint.needs_content() {
                fs::remove_file(path)?;
                utils::create_symlink(target, path)?;
            }
            if hint.has_change(ChangeFlag::OwnerChanged) {
                apply_owner(path, *owner);
            }
            report.symlinks_restored += 1;
        }
        PathState::Directory { owner, mode, .. } => {
            if hint.has_change(ChangeFlag::PermissionsChanged) {
                utils::set_permissions(path, *mode)?;
            }
            if hint.has_change(ChangeFlag::OwnerChanged) {
                apply_owner(path, *owner);
            }
            // the mtime is reapplied after the children are restored
            report.directories_restored += 1;
        }
        PathState::NonExisting => {}
    }
    Ok(())
}

/// Create a missing entry from its recorded state
fn create_entry(
    repo: &Repository,
    path: &Path,
    state: &PathState,
    report: &mut RestoreReport,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    match state {
        PathState::NonExisting => {}
        PathState::Regular { owner, info } => {
            write_file_content(repo, path, info)?;
            utils::set_permissions(path, info.mode)?;
            apply_owner(path, *owner);
            utils::set_modified(path, info.modified)?;
            report.files_restored += 1;
            report.bytes_written += info.size;
            debug!("Created file {:?} ({} bytes)", path, info.size);
        }
        PathState::Symlink { owner, target } => {
            utils::create_symlink(target, path)?;
            apply_owner(path, *owner);
            report.symlinks_restored += 1;
            debug!("Created symlink {:?} -> {:?}", path, target);
        }
        PathState::Directory { owner, mode, .. } => {
            fs::create_dir(path)?;
            utils::set_permissions(path, *mode)?;
            apply_owner(path, *owner);
            report.directories_restored += 1;
            debug!("Created directory {:?}", path);
        }
    }
    Ok(())
}

/// Write a regular file's bytes from the embedded digest or the repository
fn write_file_content(repo: &Repository, path: &Path, info: &RegularFileInfo) -> Result<()> {
    let mut file = File::create(path).map_err(|e| KeepsakeError::path_io(path, e))?;
    if info.is_embedded() {
        file.write_all(info.digest.embedded_bytes(info.size))
            .map_err(|e| KeepsakeError::path_io(path, e))?;
    } else {
        repo.read_to(&info.digest, info.size, info.slot, path, &mut file)?;
    }
    Ok(())
}

/// Ownership restoration needs privileges; degrade to a warning without them
fn apply_owner(path: &Path, owner: crate::types::Owner) {
    if let Err(e) = utils::set_owner(path, owner) {
        warn!("Could not restore owner of {:?}: {}", path, e);
    }
}

fn remove_entry(path: &Path, is_directory: bool) -> Result<()> {
    if is_directory {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup;
    use crate::hint::Hint;
    use crate::scan::FsSearch;
    use crate::types::Policy;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        repo: Repository,
        catalog: Catalog,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir(&root).unwrap();
        let repo = Repository::create(temp.path().join("repo")).unwrap();
        Fixture {
            _temp: temp,
            root,
            repo,
            catalog: Catalog::new(),
        }
    }

    fn run_backup(fx: &mut Fixture) -> BackupId {
        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Copy)], &[]).unwrap();
        backup::initiate(&mut fx.catalog, &mut feed).unwrap();
        let summary = backup::finish(&mut fx.catalog, &fx.repo, None).unwrap();
        clear_hints(&mut fx.catalog.roots);
        summary.backup.unwrap()
    }

    fn clear_hints(nodes: &mut [PathNode]) {
        for node in nodes {
            node.hint = Hint::none();
            clear_hints(&mut node.subnodes);
        }
    }

    #[test]
    fn test_restore_earlier_content() {
        let mut fx = fixture();
        let file = fx.root.join("doc.txt");
        let v1 = vec![0x11u8; 2048];
        fs::write(&file, &v1).unwrap();
        let b1 = run_backup(&mut fx);

        fs::write(&file, vec![0x22u8; 3000]).unwrap();
        run_backup(&mut fx);

        let report = restore_path(&fx.catalog, &fx.repo, &fx.root, b1).unwrap();
        assert_eq!(report.files_restored, 1);
        assert_eq!(report.bytes_written, 2048);
        assert_eq!(fs::read(&file).unwrap(), v1);
    }

    #[test]
    fn test_restore_reapplies_mtime() {
        let mut fx = fixture();
        let file = fx.root.join("dated.txt");
        fs::write(&file, b"first").unwrap();
        let b1 = run_backup(&mut fx);
        let recorded = utils::file_stat(&file).unwrap().modified;

        fs::write(&file, b"rewritten later").unwrap();
        run_backup(&mut fx);

        restore_path(&fx.catalog, &fx.repo, &file, b1).unwrap();
        let live = utils::file_stat(&file).unwrap();
        assert_eq!(live.modified, recorded);
        assert_eq!(fs::read(&file).unwrap(), b"first");
    }

    #[test]
    fn test_restore_current_state_touches_nothing() {
        let mut fx = fixture();
        fs::write(fx.root.join("same.txt"), b"identical").unwrap();
        let b1 = run_backup(&mut fx);

        let report = restore_path(&fx.catalog, &fx.repo, &fx.root, b1).unwrap();
        assert_eq!(report.files_restored, 0);
        assert_eq!(report.bytes_written, 0);
        assert_eq!(report.entries_removed, 0);
        assert_eq!(report.entries_unchanged, 2);
    }

    #[test]
    fn test_restore_removes_entries_absent_from_snapshot() {
        let mut fx = fixture();
        fs::write(fx.root.join("original.txt"), b"kept").unwrap();
        let b1 = run_backup(&mut fx);

        // a file that only exists after the target snapshot
        fs::write(fx.root.join("newcomer.txt"), b"too new").unwrap();
        run_backup(&mut fx);

        let report = restore_path(&fx.catalog, &fx.repo, &fx.root, b1).unwrap();
        assert_eq!(report.entries_removed, 1);
        assert!(!fx.root.join("newcomer.txt").exists());
        assert!(fx.root.join("original.txt").exists());
    }

    #[test]
    fn test_restore_recreates_removed_file() {
        let mut fx = fixture();
        let file = fx.root.join("resurrect.txt");
        fs::write(&file, b"bring me back").unwrap();
        let b1 = run_backup(&mut fx);

        fs::remove_file(&file).unwrap();
        run_backup(&mut fx);
        assert!(!file.exists());

        let report = restore_path(&fx.catalog, &fx.repo, &fx.root, b1).unwrap();
        assert_eq!(report.files_restored, 1);
        assert_eq!(fs::read(&file).unwrap(), b"bring me back");
    }

    #[test]
    fn test_restore_after_removal_point_fails_for_requested_path() {
        let mut fx = fixture();
        let file = fx.root.join("gone.txt");
        fs::write(&file, b"short lived").unwrap();
        run_backup(&mut fx);

        fs::remove_file(&file).unwrap();
        let b2 = run_backup(&mut fx);

        // the path has no point at or after b2 + 1
        let err = restore_path(&fx.catalog, &fx.repo, &file, BackupId(b2.0 + 1)).unwrap_err();
        assert!(matches!(err, KeepsakeError::NoStateAtBackup { .. }));
    }

    #[test]
    fn test_restore_untracked_path_fails() {
        let fx = fixture();
        let err = restore_path(
            &fx.catalog,
            &fx.repo,
            Path::new("/nowhere/special"),
            BackupId(1),
        )
        .unwrap_err();
        assert!(matches!(err, KeepsakeError::PathNotTracked(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_symlink_target() {
        let mut fx = fixture();
        let link = fx.root.join("pointer");
        utils::create_symlink(Path::new("first-target"), &link).unwrap();
        let b1 = run_backup(&mut fx);

        fs::remove_file(&link).unwrap();
        utils::create_symlink(Path::new("other-target"), &link).unwrap();
        run_backup(&mut fx);

        let report = restore_path(&fx.catalog, &fx.repo, &fx.root, b1).unwrap();
        assert_eq!(report.symlinks_restored, 1);
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("first-target"));
    }

    #[test]
    fn test_restore_directory_kind_change() {
        let mut fx = fixture();
        let entry = fx.root.join("mutable");
        fs::write(&entry, b"file at first").unwrap();
        let b1 = run_backup(&mut fx);

        fs::remove_file(&entry).unwrap();
        fs::create_dir(&entry).unwrap();
        fs::write(entry.join("inner.txt"), b"inside").unwrap();
        run_backup(&mut fx);

        restore_path(&fx.catalog, &fx.repo, &fx.root, b1).unwrap();
        assert!(entry.is_file());
        assert_eq!(fs::read(&entry).unwrap(), b"file at first");
    }
}

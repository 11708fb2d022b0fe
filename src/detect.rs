//! Change detection between a recorded state and a live filesystem entry
//!
//! The detector is shared by both directions of the tool: backup compares
//! the live filesystem against the last recorded state to decide what to
//! record, and restore compares a resolved historical state against the
//! live filesystem to decide what must change on disk.
//!
//! Detection is cheap by construction: when timestamp and size are both
//! unchanged, no file content is read at all. Content is only re-examined
//! when the metadata is ambiguous (same size, new timestamp), and a file or
//! symlink that moves under the detector between stat and read is a fatal
//! race — recording a silently wrong digest would corrupt deduplication.

use crate::error::{KeepsakeError, Result};
use crate::hint::{ChangeFlag, Hint, HintStatus};
use crate::types::{ContentDigest, FileStat, PathKind, PathState, RegularFileInfo};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Result of comparing a recorded state against a live entry
#[derive(Debug, Clone)]
pub struct Detection {
    /// The state updated to match the live entry
    ///
    /// A regular file whose content changed carries a placeholder digest;
    /// hashing is deferred to the finish phase unless the hint says a fresh
    /// hash was already computed.
    pub state: PathState,
    /// What changed, merged by tier
    pub hint: Hint,
}

/// Compare a recorded state against a live filesystem stat
///
/// Owner is compared unconditionally; the rest dispatches on the state's
/// variant. See the module docs for the read-avoidance and race rules.
///
/// # Errors
///
/// - [`KeepsakeError::FileChanged`] / [`KeepsakeError::SymlinkChanged`] on
///   a detected stat-to-read race (fatal, never retried)
/// - [`KeepsakeError::Io`] on filesystem failures
pub fn detect(path: &Path, last: &PathState, stat: &FileStat) -> Result<Detection> {
    let mut hint = Hint::none();

    // a kind the repository cannot store
    if stat.kind == PathKind::Other {
        hint.set_status(HintStatus::NotPartOfRepository);
        return Ok(Detection {
            state: PathState::NonExisting,
            hint,
        });
    }

    // previously absent: no comparison possible, everything is new
    let Some(last_kind) = last.kind() else {
        hint.set_status(HintStatus::Added);
        return Ok(Detection {
            state: state_from_stat(path, stat)?,
            hint,
        });
    };

    let mut state = last.clone();
    if last.owner() != Some(stat.owner()) {
        hint.add_change(ChangeFlag::OwnerChanged);
        state.set_owner(stat.owner());
    }

    if last_kind != stat.kind {
        // the entry was replaced wholesale; the transition status supersedes
        // any accumulated flags
        hint.set_status(transition_status(last_kind, stat.kind)?);
        return Ok(Detection {
            state: state_from_stat(path, stat)?,
            hint,
        });
    }

    match &mut state {
        PathState::Regular { info, .. } => detect_regular(path, info, stat, &mut hint)?,
        PathState::Symlink { target, .. } => detect_symlink(path, target, stat, &mut hint)?,
        PathState::Directory { mode, modified, .. } => {
            if *mode != stat.mode {
                hint.add_change(ChangeFlag::PermissionsChanged);
                *mode = stat.mode;
            }
            if *modified != stat.modified {
                hint.add_change(ChangeFlag::TimestampChanged);
                *modified = stat.modified;
            }
        }
        // absent states were dispatched above
        PathState::NonExisting => {}
    }

    if hint.is_empty() {
        hint.set_status(HintStatus::Unchanged);
    }
    trace!("Detected {:?}: {}", path, hint);
    Ok(Detection { state, hint })
}

/// Build a fresh state for a live entry with no comparable prior state
///
/// Regular files get a placeholder digest; the finish phase computes and
/// stores the real one.
pub fn state_from_stat(path: &Path, stat: &FileStat) -> Result<PathState> {
    match stat.kind {
        PathKind::Regular => Ok(PathState::Regular {
            owner: stat.owner(),
            info: RegularFileInfo {
                mode: stat.mode,
                modified: stat.modified,
                size: stat.size,
                digest: ContentDigest::ZERO,
                slot: 0,
            },
        }),
        PathKind::Symlink => Ok(PathState::Symlink {
            owner: stat.owner(),
            target: read_link_checked(path, stat.size)?,
        }),
        PathKind::Directory => Ok(PathState::Directory {
            owner: stat.owner(),
            mode: stat.mode,
            modified: stat.modified,
        }),
        PathKind::Other => Err(KeepsakeError::internal(format!(
            "cannot build a state for unstorable entry {:?}",
            path
        ))),
    }
}

fn detect_regular(
    path: &Path,
    info: &mut RegularFileInfo,
    stat: &FileStat,
    hint: &mut Hint,
) -> Result<()> {
    if info.mode != stat.mode {
        hint.add_change(ChangeFlag::PermissionsChanged);
        info.mode = stat.mode;
    }

    let mtime_changed = info.modified != stat.modified;
    if mtime_changed {
        hint.add_change(ChangeFlag::TimestampChanged);
        info.modified = stat.modified;
    }

    if info.size != stat.size {
        hint.add_change(ChangeFlag::ContentChanged);
        info.size = stat.size;
        info.digest = ContentDigest::ZERO;
        info.slot = 0;
    } else if mtime_changed && stat.size > 0 {
        // same size, new timestamp: the content must be re-examined
        let fresh = utils::digest_file(path, stat.size, stat.block_size)?;
        if fresh != info.digest {
            hint.add_change(ChangeFlag::ContentChanged);
            hint.add_change(ChangeFlag::FreshHashComputed);
            info.digest = fresh;
            info.slot = 0;
        }
    }

    Ok(())
}

fn detect_symlink(
    path: &Path,
    target: &mut PathBuf,
    stat: &FileStat,
    hint: &mut Hint,
) -> Result<()> {
    let live = read_link_checked(path, stat.size)?;
    if *target != live {
        hint.add_change(ChangeFlag::ContentChanged);
        *target = live;
    }
    Ok(())
}

/// Read a symlink target, verifying it still has the stat'd length
///
/// A target that grew or shrank between stat and read would otherwise be
/// recorded truncated or padded.
fn read_link_checked(path: &Path, expected_len: u64) -> Result<PathBuf> {
    let target = fs::read_link(path)?;
    if target.as_os_str().len() as u64 != expected_len {
        return Err(KeepsakeError::SymlinkChanged(path.to_path_buf()));
    }
    Ok(target)
}

/// Map an ordered kind transition to its status value
fn transition_status(from: PathKind, to: PathKind) -> Result<HintStatus> {
    use PathKind::*;
    match (from, to) {
        (Regular, Symlink) => Ok(HintStatus::RegularToSymlink),
        (Regular, Directory) => Ok(HintStatus::RegularToDirectory),
        (Symlink, Regular) => Ok(HintStatus::SymlinkToRegular),
        (Symlink, Directory) => Ok(HintStatus::SymlinkToDirectory),
        (Directory, Regular) => Ok(HintStatus::DirectoryToRegular),
        (Directory, Symlink) => Ok(HintStatus::DirectoryToSymlink),
        (from, to) => Err(KeepsakeError::internal(format!(
            "impossible kind transition {:?} -> {:?}",
            from, to
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hint::PolicyFlag;
    use std::fs;
    use tempfile::TempDir;

    /// Record the current state of a path the way a first backup would
    fn recorded_state(path: &Path) -> (PathState, FileStat) {
        let stat = utils::file_stat(path).unwrap();
        let detection = detect(path, &PathState::NonExisting, &stat).unwrap();
        let mut state = detection.state;
        // fill in the deferred digest like the finish phase does
        if let PathState::Regular { info, .. } = &mut state {
            if info.size > 0 {
                info.digest = utils::digest_file(path, info.size, stat.block_size).unwrap();
            }
        }
        (state, stat)
    }

    #[test]
    fn test_new_path_is_added_with_deferred_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("new.txt");
        fs::write(&file, b"dummy").unwrap();

        let stat = utils::file_stat(&file).unwrap();
        let detection = detect(&file, &PathState::NonExisting, &stat).unwrap();

        assert_eq!(detection.hint.status(), HintStatus::Added);
        // hashing is deferred on first discovery
        assert!(!detection.hint.has_change(ChangeFlag::FreshHashComputed));
        match detection.state {
            PathState::Regular { info, .. } => {
                assert_eq!(info.size, 5);
                assert_eq!(info.digest, ContentDigest::ZERO);
            }
            other => panic!("expected regular state, got {:?}", other),
        }
    }

    #[test]
    fn test_unchanged_performs_zero_reads() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("quiet.txt");
        fs::write(&file, b"stable content").unwrap();

        let (state, stat) = recorded_state(&file);

        // delete the file: if the detector tried to read it, it would fail
        fs::remove_file(&file).unwrap();
        let detection = detect(&file, &state, &stat).unwrap();
        assert_eq!(detection.hint.status(), HintStatus::Unchanged);
        assert_eq!(detection.state, state);
    }

    #[test]
    fn test_timestamp_only_change() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("touched.txt");
        fs::write(&file, b"same content").unwrap();

        let (state, stat) = recorded_state(&file);

        // new mtime, identical content
        let later = stat.modified + chrono::Duration::seconds(5);
        utils::set_modified(&file, later).unwrap();
        let live = utils::file_stat(&file).unwrap();
        assert_ne!(live.modified, stat.modified);

        let detection = detect(&file, &state, &live).unwrap();
        assert!(detection.hint.has_change(ChangeFlag::TimestampChanged));
        assert!(!detection.hint.has_change(ChangeFlag::ContentChanged));
    }

    #[test]
    fn test_content_change_same_size_computes_fresh_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("swapped.txt");
        fs::write(&file, b"aaaa").unwrap();

        let (state, stat) = recorded_state(&file);

        fs::write(&file, b"bbbb").unwrap();
        let later = stat.modified + chrono::Duration::seconds(5);
        utils::set_modified(&file, later).unwrap();
        let live = utils::file_stat(&file).unwrap();
        assert_eq!(live.size, stat.size);

        let detection = detect(&file, &state, &live).unwrap();
        assert!(detection.hint.has_change(ChangeFlag::ContentChanged));
        assert!(detection.hint.has_change(ChangeFlag::FreshHashComputed));
        match detection.state {
            PathState::Regular { info, .. } => {
                assert_eq!(info.digest.embedded_bytes(4), b"bbbb");
            }
            other => panic!("expected regular state, got {:?}", other),
        }
    }

    #[test]
    fn test_size_change_defers_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("grown.txt");
        fs::write(&file, b"short").unwrap();

        let (state, _stat) = recorded_state(&file);

        fs::write(&file, b"much longer content now").unwrap();
        let live = utils::file_stat(&file).unwrap();

        let detection = detect(&file, &state, &live).unwrap();
        assert!(detection.hint.has_change(ChangeFlag::ContentChanged));
        assert!(!detection.hint.has_change(ChangeFlag::FreshHashComputed));
        match detection.state {
            PathState::Regular { info, .. } => assert_eq!(info.digest, ContentDigest::ZERO),
            other => panic!("expected regular state, got {:?}", other),
        }
    }

    #[test]
    fn test_owner_change_flag() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("chowned.txt");
        fs::write(&file, b"content").unwrap();

        let (state, mut stat) = recorded_state(&file);
        stat.uid += 1;

        let detection = detect(&file, &state, &stat).unwrap();
        assert!(detection.hint.has_change(ChangeFlag::OwnerChanged));
        assert!(!detection.hint.has_policy(PolicyFlag::PolicyChanged));
        assert_eq!(detection.state.owner().unwrap().uid, stat.uid);
    }

    #[test]
    fn test_kind_transition_sets_status() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("entry");
        fs::write(&file, b"file for now").unwrap();

        let (state, _stat) = recorded_state(&file);

        fs::remove_file(&file).unwrap();
        fs::create_dir(&file).unwrap();
        let live = utils::file_stat(&file).unwrap();

        let detection = detect(&file, &state, &live).unwrap();
        assert_eq!(detection.hint.status(), HintStatus::RegularToDirectory);
        assert!(detection.state.is_directory());
    }

    #[test]
    fn test_small_file_grown_between_stat_and_read_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("racy.txt");
        fs::write(&file, b"12345").unwrap();

        let (state, stat) = recorded_state(&file);

        // the file grows after the stat was taken; the stale stat still
        // claims the old size with a newer timestamp
        fs::write(&file, b"12345 plus surprise growth").unwrap();
        let mut stale = stat;
        stale.modified = stat.modified + chrono::Duration::seconds(5);

        let err = detect(&file, &state, &stale).unwrap_err();
        assert!(err.is_race());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_growth_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let link = temp_dir.path().join("link");
        utils::create_symlink(Path::new("old-target"), &link).unwrap();

        let (state, stat) = recorded_state(&link);

        // target replaced with a longer one after the stat
        fs::remove_file(&link).unwrap();
        utils::create_symlink(Path::new("considerably-longer-target"), &link).unwrap();

        let err = detect(&link, &state, &stat).unwrap_err();
        assert!(matches!(err, KeepsakeError::SymlinkChanged(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_retarget_is_content_change() {
        let temp_dir = TempDir::new().unwrap();
        let link = temp_dir.path().join("link");
        utils::create_symlink(Path::new("target-one"), &link).unwrap();

        let (state, _stat) = recorded_state(&link);

        fs::remove_file(&link).unwrap();
        utils::create_symlink(Path::new("target-two"), &link).unwrap();
        let live = utils::file_stat(&link).unwrap();

        let detection = detect(&link, &state, &live).unwrap();
        assert!(detection.hint.has_change(ChangeFlag::ContentChanged));
        match detection.state {
            PathState::Symlink { target, .. } => {
                assert_eq!(target, PathBuf::from("target-two"))
            }
            other => panic!("expected symlink state, got {:?}", other),
        }
    }
}

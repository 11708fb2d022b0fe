//! Utility functions for keepsake
//!
//! This module provides common helpers used throughout the library:
//! filesystem stat extraction, content digesting, permission/owner/mtime
//! application, directory fsync for the repository's durability protocol,
//! and byte formatting for summaries.
//!
//! ## Cross-Platform Behavior
//!
//! keepsake records Unix ownership and permission bits. On non-Unix
//! platforms owners read as 0/0 and permission handling degrades to the
//! read-only attribute, mirroring how the rest of the metadata is
//! approximated there.

use crate::error::{KeepsakeError, Result};
use crate::types::{ContentDigest, FileStat, Owner, PathKind, DIGEST_LEN};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::trace;

/// Fallback block size when the filesystem does not report one
const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Stat a live filesystem entry without following symlinks
///
/// Classifies the entry kind, extracts ownership, permission bits,
/// modification time, size and the filesystem's preferred I/O block size.
///
/// # Errors
///
/// - [`KeepsakeError::Io`] if the entry cannot be stat'd
pub fn file_stat(path: &Path) -> Result<FileStat> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();

    let kind = if file_type.is_file() {
        PathKind::Regular
    } else if file_type.is_dir() {
        PathKind::Directory
    } else if file_type.is_symlink() {
        PathKind::Symlink
    } else {
        PathKind::Other
    };

    let modified: DateTime<Utc> = metadata.modified()?.into();
    let owner = owner_of(&metadata);

    Ok(FileStat {
        kind,
        uid: owner.uid,
        gid: owner.gid,
        mode: permission_bits(&metadata),
        modified,
        size: metadata.len(),
        block_size: preferred_block_size(&metadata),
    })
}

/// Compute the content digest of a regular file
///
/// Files larger than [`DIGEST_LEN`] bytes are streamed through SHA-256 in
/// blocks of the filesystem's preferred I/O size. Files at or below the
/// digest length are read literally and embedded — no hash function is
/// invoked — with an end-of-file assertion: any surplus or shortfall means
/// the file changed between stat and read, which is a fatal race.
///
/// # Errors
///
/// - [`KeepsakeError::FileChanged`] if a small file's length no longer
///   matches the stat'd size
/// - [`KeepsakeError::Io`] on any other read failure
pub fn digest_file(path: &Path, size: u64, block_size: u64) -> Result<ContentDigest> {
    if size <= DIGEST_LEN as u64 {
        read_embedded(path, size)
    } else {
        hash_file_streaming(path, block_size)
    }
}

/// Read a small file's literal content into an embedded digest
///
/// Reads exactly `size` bytes and asserts the stream is then at end of
/// file; more or fewer bytes than the stat reported is a race.
pub fn read_embedded(path: &Path, size: u64) -> Result<ContentDigest> {
    debug_assert!(size <= DIGEST_LEN as u64);
    let mut file = File::open(path)?;
    let mut content = vec![0u8; size as usize];
    file.read_exact(&mut content)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => KeepsakeError::FileChanged(path.to_path_buf()),
            _ => KeepsakeError::Io(e),
        })?;
    let mut probe = [0u8; 1];
    if file.read(&mut probe)? != 0 {
        return Err(KeepsakeError::FileChanged(path.to_path_buf()));
    }
    Ok(ContentDigest::embed(&content))
}

/// Stream a file through SHA-256 in filesystem-preferred blocks
pub fn hash_file_streaming(path: &Path, block_size: u64) -> Result<ContentDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; block_size.max(512) as usize];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ContentDigest(hasher.finalize().into()))
}

/// Get ownership from metadata
#[cfg(unix)]
fn owner_of(metadata: &fs::Metadata) -> Owner {
    use std::os::unix::fs::MetadataExt;
    Owner {
        uid: metadata.uid(),
        gid: metadata.gid(),
    }
}

/// Get ownership from metadata (non-Unix: no ownership model)
#[cfg(not(unix))]
fn owner_of(_metadata: &fs::Metadata) -> Owner {
    Owner { uid: 0, gid: 0 }
}

/// Get Unix permission bits from metadata
#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permission bits from metadata (non-Unix implementation)
#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    // Map the read-only attribute to Unix-like permissions
    let mut mode = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Preferred I/O block size of the filesystem holding the entry
#[cfg(unix)]
fn preferred_block_size(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    let blksize = metadata.blksize();
    if blksize == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        blksize
    }
}

/// Preferred I/O block size (non-Unix implementation)
#[cfg(not(unix))]
fn preferred_block_size(_metadata: &fs::Metadata) -> u64 {
    DEFAULT_BLOCK_SIZE
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set permissions (non-Unix implementation)
#[cfg(not(unix))]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Set ownership without following symlinks (best effort)
///
/// Restoring ownership usually needs privileges; failures are reported to
/// the caller, which may choose to downgrade them to warnings.
#[cfg(unix)]
pub fn set_owner(path: &Path, owner: Owner) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid))?;
    Ok(())
}

/// Set ownership (non-Unix: no ownership model)
#[cfg(not(unix))]
pub fn set_owner(_path: &Path, _owner: Owner) -> Result<()> {
    Ok(())
}

/// Set a file's modification time
pub fn set_modified(path: &Path, modified: DateTime<Utc>) -> Result<()> {
    let mtime = filetime::FileTime::from_system_time(modified.into());
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Flush a directory's entries to stable storage
///
/// Part of the repository write protocol: a rename is only durable once the
/// containing directory has been fsync'd.
#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    trace!("fsync {:?}", path);
    Ok(())
}

/// Flush a directory (non-Unix: directories cannot be opened for sync)
#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based). Values below 1 KB are shown as whole
/// numbers, larger values with two decimal places.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_stat_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file.txt");
        fs::write(&file, b"hello").unwrap();

        let stat = file_stat(&file).unwrap();
        assert_eq!(stat.kind, PathKind::Regular);
        assert_eq!(stat.size, 5);
        assert!(stat.block_size >= 512);

        let stat = file_stat(temp_dir.path()).unwrap();
        assert_eq!(stat.kind, PathKind::Directory);
    }

    #[test]
    fn test_digest_small_file_embeds_content() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("small.txt");
        fs::write(&file, b"dummy").unwrap();

        let digest = digest_file(&file, 5, 4096).unwrap();
        assert_eq!(digest.embedded_bytes(5), b"dummy");
    }

    #[test]
    fn test_digest_large_file_hashes() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("large.txt");
        let content = vec![0xabu8; 1000];
        fs::write(&file, &content).unwrap();

        let digest = digest_file(&file, 1000, 4096).unwrap();
        assert_eq!(digest, ContentDigest::hash_bytes(&content));
    }

    #[test]
    fn test_embedded_read_detects_growth() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("grown.txt");
        fs::write(&file, b"longer than the stat said").unwrap();

        // stat claimed 5 bytes, but more data remains: a race
        let err = read_embedded(&file, 5).unwrap_err();
        assert!(err.is_race());
    }

    #[test]
    fn test_embedded_read_detects_shrink() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("shrunk.txt");
        fs::write(&file, b"ab").unwrap();

        let err = read_embedded(&file, 10).unwrap_err();
        assert!(err.is_race());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
    }
}

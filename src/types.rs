//! Core data types used throughout the keepsake library
//!
//! This module contains fundamental data structures that are shared across
//! different components of the library.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Content addressing**: [`ContentDigest`], [`RegularFileInfo`] - how file
//!   content is identified and deduplicated
//! - **Path state**: [`PathState`], [`Owner`], [`PathKind`] - what a tracked
//!   path looked like at a snapshot
//! - **Snapshots**: [`BackupId`] - identity of one backup instant
//! - **The search feed**: [`SearchResult`], [`SearchEntry`], [`FileStat`] -
//!   records produced by the filesystem search and consumed by the backup
//!   initiator
//! - **Operations**: [`BackupSummary`], [`RestoreReport`] - results of
//!   backup and restore runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Length in bytes of a content digest (SHA-256)
///
/// Files whose size is at or below this length are not hashed at all: the
/// digest field carries their literal content instead.
pub const DIGEST_LEN: usize = 32;

/// Identifier of one backup instant
///
/// Ids are assigned sequentially and are strictly ascending across the
/// lifetime of a catalog, which is what makes history sequences ordered
/// and restore-time resolution well defined.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BackupId(pub u64);

impl BackupId {
    /// The id that will follow this one
    pub fn next(self) -> BackupId {
        BackupId(self.0 + 1)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content address of a regular file
///
/// For files larger than [`DIGEST_LEN`] bytes this is the SHA-256 hash of
/// the content. For files at or below [`DIGEST_LEN`] bytes it holds the
/// literal file content, zero padded; only the first `size` bytes are
/// meaningful. The embedding avoids both a hash computation and a
/// repository object for tiny files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub [u8; DIGEST_LEN]);

impl ContentDigest {
    /// Digest of all-zero bytes, used as the placeholder while hashing is
    /// deferred to the finish phase
    pub const ZERO: ContentDigest = ContentDigest([0u8; DIGEST_LEN]);

    /// Hash a byte slice (for content longer than [`DIGEST_LEN`])
    pub fn hash_bytes(data: &[u8]) -> ContentDigest {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hasher.finalize().into())
    }

    /// Embed literal content (for content at or below [`DIGEST_LEN`] bytes)
    ///
    /// No hash function is invoked; the bytes are copied verbatim and the
    /// remainder is zero padded.
    pub fn embed(data: &[u8]) -> ContentDigest {
        debug_assert!(data.len() <= DIGEST_LEN);
        let mut raw = [0u8; DIGEST_LEN];
        raw[..data.len()].copy_from_slice(data);
        ContentDigest(raw)
    }

    /// The embedded literal bytes of a small file of the given size
    pub fn embedded_bytes(&self, size: u64) -> &[u8] {
        debug_assert!(size as usize <= DIGEST_LEN);
        &self.0[..size as usize]
    }

    /// Hex rendering of the digest (64 lowercase characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

/// Owning user and group of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

/// Recorded state of a regular file
///
/// This is the wire contract for regular files: the meaning of `digest`
/// depends on whether `size` exceeds [`DIGEST_LEN`] (hash above, literal
/// content at or below), and `slot` disambiguates repository objects whose
/// digest and size collide. `slot` is unused for embedded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularFileInfo {
    /// Unix permission bits
    pub mode: u32,
    /// Last modification timestamp
    pub modified: DateTime<Utc>,
    /// File size in bytes
    pub size: u64,
    /// Content hash, or literal content for small files
    pub digest: ContentDigest,
    /// Collision slot in the repository (0-255)
    pub slot: u8,
}

impl RegularFileInfo {
    /// Whether the digest field embeds the literal file content
    pub fn is_embedded(&self) -> bool {
        self.size <= DIGEST_LEN as u64
    }
}

/// State of one tracked path at one snapshot
///
/// A closed sum type: each variant carries exactly the fields that are
/// defined for it. `NonExisting` records that the path was absent (owner
/// included — there is nothing to own).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathState {
    /// The path did not exist at this snapshot
    NonExisting,
    /// A regular file
    Regular {
        /// Owning user and group
        owner: Owner,
        /// Content and metadata of the file
        info: RegularFileInfo,
    },
    /// A symbolic link
    Symlink {
        /// Owning user and group
        owner: Owner,
        /// Link target
        target: PathBuf,
    },
    /// A directory
    Directory {
        /// Owning user and group
        owner: Owner,
        /// Unix permission bits
        mode: u32,
        /// Last modification timestamp
        modified: DateTime<Utc>,
    },
}

impl PathState {
    /// The kind of filesystem entry this state records, if any
    pub fn kind(&self) -> Option<PathKind> {
        match self {
            PathState::NonExisting => None,
            PathState::Regular { .. } => Some(PathKind::Regular),
            PathState::Symlink { .. } => Some(PathKind::Symlink),
            PathState::Directory { .. } => Some(PathKind::Directory),
        }
    }

    /// Owner of the entry, undefined for `NonExisting`
    pub fn owner(&self) -> Option<Owner> {
        match self {
            PathState::NonExisting => None,
            PathState::Regular { owner, .. }
            | PathState::Symlink { owner, .. }
            | PathState::Directory { owner, .. } => Some(*owner),
        }
    }

    /// Replace the owner, a no-op for `NonExisting`
    pub fn set_owner(&mut self, new: Owner) {
        match self {
            PathState::NonExisting => {}
            PathState::Regular { owner, .. }
            | PathState::Symlink { owner, .. }
            | PathState::Directory { owner, .. } => *owner = new,
        }
    }

    /// Whether this state records a directory
    pub fn is_directory(&self) -> bool {
        matches!(self, PathState::Directory { .. })
    }
}

/// Kind of a live filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathKind {
    /// Regular file
    Regular,
    /// Symbolic link
    Symlink,
    /// Directory
    Directory,
    /// Anything else (fifo, socket, device) — not storable in the repository
    Other,
}

/// Snapshot of a live filesystem stat
///
/// Produced by the search feed and consumed by the change detector. The
/// preferred block size is carried along so that content re-examination can
/// stream the file in the filesystem's preferred I/O size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Kind of the entry
    pub kind: PathKind,
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Unix permission bits
    pub mode: u32,
    /// Last modification timestamp
    pub modified: DateTime<Utc>,
    /// Size in bytes (target length for symlinks)
    pub size: u64,
    /// Preferred I/O block size of the underlying filesystem
    pub block_size: u64,
}

impl FileStat {
    /// Owner recorded in this stat
    pub fn owner(&self) -> Owner {
        Owner {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Per-path retention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Keep the full history of every recorded state
    Copy,
    /// Keep only the most recent state
    Mirror,
    /// Keep only the most recent state, and forget the path entirely once
    /// it disappears from the filesystem
    Transient,
}

impl Policy {
    /// Whether this policy retains more than the latest history point
    pub fn retains_history(self) -> bool {
        matches!(self, Policy::Copy)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Policy::Copy => "copy",
            Policy::Mirror => "mirror",
            Policy::Transient => "transient",
        };
        f.write_str(name)
    }
}

/// One discovered filesystem entry with its policy and stat
#[derive(Debug, Clone)]
pub struct SearchEntry {
    /// Absolute path of the entry
    pub path: PathBuf,
    /// Retention policy that applies to the entry
    pub policy: Policy,
    /// Live stat of the entry
    pub stat: FileStat,
}

/// One record yielded by the search feed
///
/// Directory results are followed by the directory's children and a closing
/// `EndOfDirectory` sentinel; the whole feed ends with `EndOfSearch`.
#[derive(Debug, Clone)]
pub enum SearchResult {
    /// A regular file
    Regular(SearchEntry),
    /// A symbolic link
    Symlink(SearchEntry),
    /// A directory; its children follow until `EndOfDirectory`
    Directory(SearchEntry),
    /// An entry of a kind the repository does not store
    Other(SearchEntry),
    /// Closes the most recently opened directory
    EndOfDirectory,
    /// Closes the feed
    EndOfSearch,
}

/// Statistics of one backup run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSummary {
    /// Id of the committed backup (None until the finish phase commits)
    pub backup: Option<BackupId>,
    /// Paths newly added to the catalog
    pub paths_added: usize,
    /// Tracked paths with a detected change
    pub paths_changed: usize,
    /// Tracked paths no longer present
    pub paths_removed: usize,
    /// Tracked paths left untouched
    pub paths_unchanged: usize,
    /// Objects newly written to the repository
    pub objects_stored: usize,
    /// Bytes newly written to the repository
    pub bytes_stored: u64,
}

impl BackupSummary {
    /// Check if the run detected any difference at all
    pub fn has_changes(&self) -> bool {
        self.paths_added > 0 || self.paths_changed > 0 || self.paths_removed > 0
    }

    /// Total number of paths the run touched
    pub fn total_paths(&self) -> usize {
        self.paths_added + self.paths_changed + self.paths_removed + self.paths_unchanged
    }
}

/// Statistics of one restore run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Regular files written
    pub files_restored: usize,
    /// Directories created or adjusted
    pub directories_restored: usize,
    /// Symlinks recreated
    pub symlinks_restored: usize,
    /// Live entries removed because the snapshot records no state
    pub entries_removed: usize,
    /// Entries that already matched the snapshot
    pub entries_unchanged: usize,
    /// Content bytes written
    pub bytes_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_embedding() {
        let digest = ContentDigest::embed(b"dummy");
        assert_eq!(digest.embedded_bytes(5), b"dummy");
        // zero padded past the content
        assert_eq!(digest.0[5..], [0u8; DIGEST_LEN - 5]);
    }

    #[test]
    fn test_digest_hash_is_stable() {
        let a = ContentDigest::hash_bytes(b"some file content");
        let b = ContentDigest::hash_bytes(b"some file content");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_embedded_threshold() {
        let info = RegularFileInfo {
            mode: 0o644,
            modified: Utc::now(),
            size: DIGEST_LEN as u64,
            digest: ContentDigest::ZERO,
            slot: 0,
        };
        assert!(info.is_embedded());
        let info = RegularFileInfo {
            size: DIGEST_LEN as u64 + 1,
            ..info
        };
        assert!(!info.is_embedded());
    }

    #[test]
    fn test_backup_summary() {
        let mut summary = BackupSummary::default();
        assert!(!summary.has_changes());
        summary.paths_added = 2;
        summary.paths_unchanged = 5;
        assert!(summary.has_changes());
        assert_eq!(summary.total_paths(), 7);
    }
}

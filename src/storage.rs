//! Content-addressed repository store
//!
//! This module implements the on-disk object store that deduplicates and
//! durably persists file content.
//!
//! ## Addressing
//!
//! Every object is addressed by a `(digest, size, slot)` triple that maps
//! deterministically to one storage path:
//!
//! ```text
//! repo/<byte0>/<byte1,2>/<remaining-digest-hex>x<size-hex>x<slot-hex>
//! ```
//!
//! The two fan-out levels are keyed by the leading digest bytes so no single
//! directory accumulates too many entries. Two distinct files that hash
//! identically and have identical size collide on the same base path and are
//! disambiguated purely by `slot`, an 8-bit value. A 257th colliding file is
//! unrepresentable: writing it fails with a capacity error rather than
//! silently growing the addressing scheme, which would change the on-disk
//! format. This layout is load-bearing — it governs deduplication sharing
//! and collision resolution and must not change.
//!
//! ## Crash safety
//!
//! Writes go to a temporary file inside the repository, are fsync'd, then
//! renamed into place; missing fan-out directories are created one level at
//! a time and fsync'd immediately, and the final directory and repository
//! root are fsync'd after the rename. A crash at any point leaves either no
//! object or a complete one, never a torn write. The format assumes a
//! single writer; concurrent processes targeting the same triple corrupt
//! the store and are serialized by the process-wide repository lock held
//! around every invocation.

use crate::error::{KeepsakeError, Result};
use crate::types::ContentDigest;
use crate::utils;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Buffer size for object content comparison
const COMPARE_BLOCK: usize = 64 * 1024;

/// Outcome of storing content in the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Slot the content lives in
    pub slot: u8,
    /// Whether a new object was written (false means deduplicated)
    pub written: bool,
}

/// The content-addressed, deduplicating object store
#[derive(Debug, Clone)]
pub struct Repository {
    /// Root directory of the store
    root: PathBuf,
}

impl Repository {
    /// Create a new repository directory
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::RepositoryAlreadyExists`] if the directory exists
    pub fn create(root: PathBuf) -> Result<Repository> {
        if root.exists() {
            return Err(KeepsakeError::RepositoryAlreadyExists(root));
        }
        fs::create_dir_all(&root)?;
        info!("Initialized repository at {:?}", root);
        Ok(Repository { root })
    }

    /// Open an existing repository
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::RepositoryNotInitialized`] if the directory is
    ///   missing
    pub fn open(root: PathBuf) -> Result<Repository> {
        if !root.is_dir() {
            return Err(KeepsakeError::RepositoryNotInitialized(root));
        }
        Ok(Repository { root })
    }

    /// Open the repository, creating it if it does not exist yet
    pub fn open_or_create(root: PathBuf) -> Result<Repository> {
        if root.is_dir() {
            Repository::open(root)
        } else {
            Repository::create(root)
        }
    }

    /// Repository root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pure existence probe for an object, no side effects
    pub fn exists(&self, digest: &ContentDigest, size: u64, slot: u8) -> bool {
        self.object_path(digest, size, slot).exists()
    }

    /// Store the content of `source` under `(digest, size)`, allocating a slot
    ///
    /// Probes slots in ascending order: an existing object with identical
    /// bytes is reused (deduplication), the first free slot is written with
    /// the crash-safe protocol. The caller guarantees `digest` matches the
    /// source content.
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::SlotOverflow`] once 256 distinct objects collide
    ///   on the same `(digest, size)`
    /// - [`KeepsakeError::FileChangedDuringStore`] if the source length no
    ///   longer matches `size`
    pub fn insert(&self, source: &Path, digest: &ContentDigest, size: u64) -> Result<StoreOutcome> {
        for slot in 0..=u8::MAX {
            let target = self.object_path(digest, size, slot);
            if target.exists() {
                if self.same_content(&target, source, size)? {
                    trace!(
                        "Object {}x{:x} deduplicated into slot {}",
                        digest,
                        size,
                        slot
                    );
                    return Ok(StoreOutcome {
                        slot,
                        written: false,
                    });
                }
                // genuine hash collision, try the next slot
                continue;
            }
            self.write_object(source, digest, size, slot, &target)?;
            return Ok(StoreOutcome { slot, written: true });
        }
        Err(KeepsakeError::SlotOverflow {
            digest: digest.to_hex(),
            size,
        })
    }

    /// Read an object back in full
    ///
    /// `source` is the logical path the object belongs to; every error is
    /// reported against it rather than the physical repository path.
    pub fn read(
        &self,
        digest: &ContentDigest,
        size: u64,
        slot: u8,
        source: &Path,
    ) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(size as usize);
        self.read_to(digest, size, slot, source, &mut content)?;
        Ok(content)
    }

    /// Stream an object into a writer, enforcing the exact length
    ///
    /// Reaching end of file before `size` bytes were produced is fatal.
    pub fn read_to(
        &self,
        digest: &ContentDigest,
        size: u64,
        slot: u8,
        source: &Path,
        writer: &mut dyn Write,
    ) -> Result<u64> {
        let path = self.object_path(digest, size, slot);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                KeepsakeError::ObjectMissing(format!(
                    "{}x{:x}x{:x} (for {:?})",
                    digest, size, slot, source
                ))
            } else {
                KeepsakeError::path_io(source, e)
            }
        })?;

        let copied = io::copy(&mut file.take(size), writer)
            .map_err(|e| KeepsakeError::path_io(source, e))?;
        if copied != size {
            return Err(KeepsakeError::UnexpectedEof {
                path: source.to_path_buf(),
            });
        }
        trace!("Read object {}x{:x}x{:x}", digest, size, slot);
        Ok(copied)
    }

    /// Storage path of an object: two-level hex fan-out plus a filename
    /// carrying the remaining digest bytes, size and slot
    fn object_path(&self, digest: &ContentDigest, size: u64, slot: u8) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join(&hex[..2])
            .join(&hex[2..6])
            .join(format!("{}x{:x}x{:x}", &hex[6..], size, slot))
    }

    /// Byte-compare an existing object against a source file
    fn same_content(&self, object: &Path, source: &Path, size: u64) -> Result<bool> {
        let object_len = fs::metadata(object)?.len();
        if object_len != size {
            return Ok(false);
        }

        let mut a = File::open(object)?;
        let mut b = File::open(source).map_err(|e| KeepsakeError::path_io(source, e))?;
        let mut buf_a = vec![0u8; COMPARE_BLOCK];
        let mut buf_b = vec![0u8; COMPARE_BLOCK];

        loop {
            let n = a.read(&mut buf_a)?;
            if n == 0 {
                // source must be exhausted too
                let m = b.read(&mut buf_b).map_err(|e| KeepsakeError::path_io(source, e))?;
                return Ok(m == 0);
            }
            let mut filled = 0;
            while filled < n {
                let m = b
                    .read(&mut buf_b[filled..n])
                    .map_err(|e| KeepsakeError::path_io(source, e))?;
                if m == 0 {
                    return Ok(false);
                }
                filled += m;
            }
            if buf_a[..n] != buf_b[..n] {
                return Ok(false);
            }
        }
    }

    /// Write an object with the crash-safe protocol
    ///
    /// Temp file in the repository root, data fsync, fan-out directories
    /// created one level at a time with an immediate fsync, atomic rename,
    /// then fsync of the final directory and the repository root.
    fn write_object(
        &self,
        source: &Path,
        digest: &ContentDigest,
        size: u64,
        slot: u8,
        target: &Path,
    ) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        let mut src = File::open(source).map_err(|e| KeepsakeError::path_io(source, e))?;
        let copied = io::copy(&mut src, tmp.as_file_mut())
            .map_err(|e| KeepsakeError::path_io(source, e))?;
        if copied != size {
            return Err(KeepsakeError::FileChangedDuringStore(source.to_path_buf()));
        }
        tmp.as_file().sync_all()?;

        let hex = digest.to_hex();
        let level1 = self.root.join(&hex[..2]);
        let level2 = level1.join(&hex[2..6]);
        for dir in [&level1, &level2] {
            if !dir.is_dir() {
                fs::create_dir(dir)?;
                utils::fsync_dir(dir)?;
            }
        }

        tmp.persist(target).map_err(|e| KeepsakeError::Io(e.error))?;
        utils::fsync_dir(&level2)?;
        utils::fsync_dir(&self.root)?;

        debug!(
            "Stored object {}x{:x}x{:x} ({} bytes)",
            digest, size, slot, size
        );
        Ok(())
    }
}

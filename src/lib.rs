//! # Keepsake - Personal file backups with deduplicated history
//!
//! Keepsake maintains an arbitrarily long history of snapshots of a
//! filesystem subtree, deduplicates file content by cryptographic hash, and
//! can restore any tracked path to any prior snapshot.
//!
//! ## Overview
//!
//! A backup run works in two phases. Initiation walks a feed of discovered
//! filesystem entries, compares each against the last recorded state with
//! the change detector, and annotates the catalog with transient hints —
//! cheaply, because hashing is deferred. The finish phase then stores the
//! content of everything that changed, tracks the tool's own config file,
//! and commits a new backup marker.
//!
//! ## Architecture
//!
//! - **Catalog** ([`tree`]): the versioned path tree. Every tracked path is
//!   a node carrying an append-only, strictly-ascending history of
//!   `(backup, state)` points. Backup markers live in an arena with
//!   explicit reference counts: a path left unchanged by a run moves its
//!   newest marker forward, so markers that no history point references
//!   anymore drain to zero and are pruned.
//! - **Change Detector** ([`detect`]): turns a live stat into a diff
//!   against a recorded state. Used in both directions — backup and
//!   restore share the same comparison logic.
//! - **Backup** ([`backup`]): consumes the search feed in lock-step with
//!   the tree's recursion and produces new history points.
//! - **Repository** ([`storage`]): content-addressed, deduplicating,
//!   crash-safe object store keyed by `(digest, size, slot)`.
//! - **Restore** ([`restore`]): resolves historical states forward to the
//!   nearest not-older snapshot and applies only what differs on disk.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keepsake::{backup, restore, Catalog, FsSearch, Policy, Repository};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> keepsake::Result<()> {
//! let repo = Repository::open_or_create(PathBuf::from("./repo"))?;
//! let mut catalog = Catalog::load_or_default(Path::new("./catalog.bin"))?;
//!
//! // record a backup of one subtree
//! let mut feed = FsSearch::new(
//!     vec![(PathBuf::from("/home/user/documents"), Policy::Copy)],
//!     &[],
//! )?;
//! backup::initiate(&mut catalog, &mut feed)?;
//! let summary = backup::finish(&mut catalog, &repo, None)?;
//! catalog.save(Path::new("./catalog.bin"))?;
//! println!("Backup {} done", summary.backup.unwrap_or_default());
//!
//! // restore a file to an earlier snapshot
//! restore::restore_path(
//!     &catalog,
//!     &repo,
//!     Path::new("/home/user/documents/notes.txt"),
//!     keepsake::BackupId(1),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Small files
//!
//! Files no larger than the digest length carry their literal bytes inside
//! the digest field of their recorded state: no hash is computed and no
//! repository object is written for them.
//!
//! ## Concurrency model
//!
//! Everything is single-threaded, synchronous, blocking I/O. The only
//! crash discipline is the repository's write protocol (temp file, fsync,
//! atomic rename, directory fsyncs); a process-wide lock around whole
//! invocations is assumed to be held by the caller.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, KeepsakeError>`. Detected races (a
//! file or symlink changing between stat and read) are fatal by design:
//! recording a silently wrong digest would corrupt deduplication.

// Public API modules
pub mod backup;
pub mod config;
pub mod detect;
pub mod error;
pub mod hint;
pub mod restore;
pub mod scan;
pub mod storage;
pub mod tree;
pub mod types;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use config::{Config, RootSpec};
pub use error::{KeepsakeError, Result};
pub use hint::{ChangeFlag, Hint, HintStatus, PolicyFlag};
pub use scan::{FsSearch, SearchFeed};
pub use storage::{Repository, StoreOutcome};
pub use tree::{Backup, BackupLedger, Catalog, HistoryPoint, PathNode};
pub use types::*;
pub use utils::format_bytes;

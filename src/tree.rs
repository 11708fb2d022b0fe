//! The versioned path tree and backup ledger
//!
//! This module owns all path/version state: the arena of backup markers
//! with their reference counts, the per-path history sequences, and the
//! catalog root that ties them together and round-trips to disk.
//!
//! ## Overview
//!
//! - [`Backup`] — one snapshot instant: id, completion time, reference count
//! - [`BackupLedger`] — arena of backup markers; exactly one unfinalized
//!   "current" marker exists while a run is in progress
//! - [`HistoryPoint`] — one `(backup, state)` pair; creating a point
//!   increments the referenced backup's count by exactly one
//! - [`PathNode`] — one filesystem path across all snapshots
//! - [`Catalog`] — the metadata root: ledger, config history, root nodes,
//!   and a transient path index built at load time
//!
//! ## History semantics
//!
//! A history point `(B, S)` records that `S` was the path's state up to and
//! including backup `B`. A path left untouched by a new backup moves its
//! newest point's backup reference forward instead of appending; this is
//! what lets fully superseded backup markers drain to a reference count of
//! zero and be pruned at save time.
//!
//! ## Invariants
//!
//! 1. History sequences are strictly ascending by backup id.
//! 2. A backup's `ref_count` equals the number of history and
//!    config-history points referencing it.
//! 3. Histories of live nodes are never empty.
//! 4. Nodes persist across type changes; `subnodes` may stay populated from
//!    snapshots where the path was a directory.

use crate::error::{KeepsakeError, Result};
use crate::hint::Hint;
use crate::types::{BackupId, PathState, Policy};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// One snapshot instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    /// Strictly ascending identifier
    pub id: BackupId,
    /// Completion timestamp; `None` only while the backup is in progress
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of history points referencing this backup
    pub ref_count: u64,
}

impl Backup {
    /// Whether no history point references this backup anymore
    pub fn is_unreferenced(&self) -> bool {
        self.ref_count == 0
    }
}

/// Arena of backup markers with explicit reference counting
///
/// History points store a [`BackupId`] into this ledger rather than sharing
/// pointers; every point creation and removal adjusts the count here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupLedger {
    /// Finalized backups, ascending by id, all referenced
    pub completed: Vec<Backup>,
    /// The in-progress backup, if a run is open
    pub current: Option<Backup>,
}

impl BackupLedger {
    /// Open the current backup marker for a new run
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::BackupInProgress`] if a marker is already open
    pub fn begin(&mut self) -> Result<BackupId> {
        if self.current.is_some() {
            return Err(KeepsakeError::BackupInProgress);
        }
        let id = self
            .completed
            .last()
            .map(|b| b.id.next())
            .unwrap_or(BackupId(1));
        self.current = Some(Backup {
            id,
            completed_at: None,
            ref_count: 0,
        });
        debug!("Opened backup marker {}", id);
        Ok(id)
    }

    /// Id of the in-progress backup, if any
    pub fn current_id(&self) -> Option<BackupId> {
        self.current.as_ref().map(|b| b.id)
    }

    /// Look up a backup marker by id
    pub fn get(&self, id: BackupId) -> Option<&Backup> {
        if let Some(current) = &self.current {
            if current.id == id {
                return Some(current);
            }
        }
        self.completed
            .binary_search_by_key(&id, |b| b.id)
            .ok()
            .map(|i| &self.completed[i])
    }

    fn get_mut(&mut self, id: BackupId) -> Option<&mut Backup> {
        if let Some(current) = &mut self.current {
            if current.id == id {
                return Some(current);
            }
        }
        self.completed
            .binary_search_by_key(&id, |b| b.id)
            .ok()
            .map(|i| &mut self.completed[i])
    }

    /// Record one new reference to a backup marker
    pub fn add_ref(&mut self, id: BackupId) -> Result<()> {
        let backup = self
            .get_mut(id)
            .ok_or(KeepsakeError::BackupNotFound(id))?;
        backup.ref_count += 1;
        Ok(())
    }

    /// Drop one reference from a backup marker, returning the remaining count
    pub fn release(&mut self, id: BackupId) -> Result<u64> {
        let backup = self
            .get_mut(id)
            .ok_or(KeepsakeError::BackupNotFound(id))?;
        if backup.ref_count == 0 {
            return Err(KeepsakeError::InvalidCatalog(format!(
                "backup {} released below zero references",
                id
            )));
        }
        backup.ref_count -= 1;
        Ok(backup.ref_count)
    }

    /// Stamp the current backup with its completion time and merge it into
    /// the finalized history
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::NoBackupInProgress`] if no marker is open
    pub fn finalize(&mut self) -> Result<BackupId> {
        let mut current = self
            .current
            .take()
            .ok_or(KeepsakeError::NoBackupInProgress)?;
        current.completed_at = Some(Utc::now());
        let id = current.id;
        if let Some(last) = self.completed.last() {
            if last.id >= id {
                return Err(KeepsakeError::InvalidCatalog(format!(
                    "finalized backup {} does not extend history ending at {}",
                    id, last.id
                )));
            }
        }
        self.completed.push(current);
        info!("Finalized backup {}", id);
        Ok(id)
    }

    /// Remove every finalized backup that has drained to zero references
    pub fn prune_unreferenced(&mut self) -> usize {
        let before = self.completed.len();
        self.completed.retain(|b| !b.is_unreferenced());
        let pruned = before - self.completed.len();
        if pruned > 0 {
            debug!("Pruned {} unreferenced backup markers", pruned);
        }
        pruned
    }

    /// Most recent finalized backup
    pub fn latest(&self) -> Option<&Backup> {
        self.completed.last()
    }
}

/// One recorded `(backup, state)` pair of a path's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// Backup marker this state was recorded under
    pub backup: BackupId,
    /// State of the path at that backup
    pub state: PathState,
}

/// Append a point to a history sequence, keeping it strictly ascending and
/// the ledger's reference counts exact
pub(crate) fn push_point(
    history: &mut Vec<HistoryPoint>,
    ledger: &mut BackupLedger,
    backup: BackupId,
    state: PathState,
) -> Result<()> {
    if let Some(last) = history.last() {
        if last.backup >= backup {
            return Err(KeepsakeError::InvalidCatalog(format!(
                "history point {} does not extend sequence ending at {}",
                backup, last.backup
            )));
        }
    }
    ledger.add_ref(backup)?;
    history.push(HistoryPoint { backup, state });
    Ok(())
}

/// Move the newest point's backup reference forward to `backup`
///
/// Used for paths an incoming backup left unchanged: the state is still the
/// recorded one, only the marker advances.
pub(crate) fn refresh_point(
    history: &mut [HistoryPoint],
    ledger: &mut BackupLedger,
    backup: BackupId,
) -> Result<()> {
    let last = history
        .last_mut()
        .ok_or_else(|| KeepsakeError::InvalidCatalog("empty history sequence".into()))?;
    if last.backup == backup {
        return Ok(());
    }
    if last.backup > backup {
        return Err(KeepsakeError::InvalidCatalog(format!(
            "cannot move marker {} backwards to {}",
            last.backup, backup
        )));
    }
    ledger.add_ref(backup)?;
    ledger.release(last.backup)?;
    last.backup = backup;
    Ok(())
}

/// One filesystem path across all snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNode {
    /// Absolute path of the entry
    pub path: PathBuf,
    /// Transient change hint for the current run (never persisted)
    #[serde(skip)]
    pub hint: Hint,
    /// Retention policy applied to the path
    pub policy: Policy,
    /// Recorded history, never empty, strictly ascending by backup id
    pub history: Vec<HistoryPoint>,
    /// Child nodes; populated only for paths that were directories in at
    /// least one snapshot
    pub subnodes: Vec<PathNode>,
}

impl PathNode {
    /// Create a node with a single initial history point
    pub fn new(
        path: PathBuf,
        policy: Policy,
        ledger: &mut BackupLedger,
        backup: BackupId,
        state: PathState,
    ) -> Result<PathNode> {
        let mut history = Vec::with_capacity(1);
        push_point(&mut history, ledger, backup, state)?;
        Ok(PathNode {
            path,
            hint: Hint::none(),
            policy,
            history,
            subnodes: Vec::new(),
        })
    }

    /// Most recent history point
    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.history.last()
    }

    /// Resolve the path's state at a target backup
    ///
    /// Latest-only policies return the single recorded point regardless of
    /// the target. Otherwise the answer is the first point whose backup id
    /// is `>= target` — forward to the nearest not-older snapshot, never a
    /// point with a smaller id when a satisfying one exists. `None` means
    /// the path has no defined state at that time.
    pub fn resolve(&self, target: BackupId) -> Option<&HistoryPoint> {
        if !self.policy.retains_history() {
            return self.history.last();
        }
        let idx = self.history.partition_point(|p| p.backup < target);
        self.history.get(idx)
    }

    /// Append a new state recorded under `backup`
    pub fn push_state(
        &mut self,
        ledger: &mut BackupLedger,
        backup: BackupId,
        state: PathState,
    ) -> Result<()> {
        push_point(&mut self.history, ledger, backup, state)
    }

    /// Advance the newest marker to `backup` without a state change
    pub fn refresh_marker(&mut self, ledger: &mut BackupLedger, backup: BackupId) -> Result<()> {
        refresh_point(&mut self.history, ledger, backup)
    }

    /// Replace the single retained point (latest-only policies)
    pub fn replace_latest(
        &mut self,
        ledger: &mut BackupLedger,
        backup: BackupId,
        state: PathState,
    ) -> Result<()> {
        if let Some(old) = self.history.pop() {
            ledger.release(old.backup)?;
        }
        push_point(&mut self.history, ledger, backup, state)
    }

    /// Discard all but the newest point, releasing the dropped references
    ///
    /// Applied when a policy change stops retaining history.
    pub fn trim_to_latest(&mut self, ledger: &mut BackupLedger) -> Result<usize> {
        let keep = match self.history.pop() {
            Some(point) => point,
            None => return Ok(0),
        };
        let dropped = std::mem::take(&mut self.history);
        for point in &dropped {
            ledger.release(point.backup)?;
        }
        self.history.push(keep);
        Ok(dropped.len())
    }

    /// Release every reference held by this node and its subtree
    ///
    /// Used when a transient node is forgotten after disappearing.
    pub fn release_subtree(&self, ledger: &mut BackupLedger) -> Result<()> {
        for point in &self.history {
            ledger.release(point.backup)?;
        }
        for sub in &self.subnodes {
            sub.release_subtree(ledger)?;
        }
        Ok(())
    }
}

/// The metadata root: every tracked path's state across all backups
///
/// Persisted with bincode behind an atomic temp-write + fsync + rename.
/// Saving honors the persistence contract: the current backup is finalized
/// and merged into the history, and markers that drained to zero references
/// are pruned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Backup markers and their reference counts
    pub ledger: BackupLedger,
    /// History of the tool's own config file (no tree path)
    pub config_history: Vec<HistoryPoint>,
    /// Advisory count of tracked paths
    pub total_paths: u64,
    /// Root-level nodes (one per configured backup root)
    pub roots: Vec<PathNode>,
    /// Transient index from path to child-index chain, for paths known at
    /// load time
    #[serde(skip)]
    index: HashMap<PathBuf, Vec<usize>>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new() -> Catalog {
        Catalog::default()
    }

    /// Load a catalog from disk, or start an empty one if the file does not
    /// exist yet
    pub fn load_or_default(path: &Path) -> Result<Catalog> {
        if path.exists() {
            Catalog::load(path)
        } else {
            debug!("No catalog at {:?}, starting empty", path);
            Ok(Catalog::new())
        }
    }

    /// Load a catalog from disk
    ///
    /// Rebuilds the transient path index and verifies the structural
    /// invariants before returning.
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::CatalogNotFound`] if the file does not exist
    /// - [`KeepsakeError::Bincode`] on a corrupt encoding
    /// - [`KeepsakeError::InvalidCatalog`] on an invariant violation
    pub fn load(path: &Path) -> Result<Catalog> {
        if !path.exists() {
            return Err(KeepsakeError::CatalogNotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        let (mut catalog, _): (Catalog, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        catalog.rebuild_index();
        catalog.verify()?;
        debug!(
            "Loaded catalog from {:?} ({} backups, {} paths)",
            path,
            catalog.ledger.completed.len(),
            catalog.total_paths
        );
        Ok(catalog)
    }

    /// Persist the catalog to disk
    ///
    /// Finalizes the current backup marker into the history (if a run is
    /// open), prunes unreferenced markers, and writes atomically: temp file
    /// in the target directory, fsync, rename, fsync of the directory.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if self.ledger.current.is_some() {
            self.ledger.finalize()?;
        }
        self.ledger.prune_unreferenced();

        let bytes = bincode::serde::encode_to_vec(&*self, bincode::config::standard())?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| KeepsakeError::Io(e.error))?;
        utils::fsync_dir(&dir)?;

        debug!("Saved catalog to {:?} ({} bytes)", path, bytes.len());
        Ok(())
    }

    /// Open the current backup marker for a new run
    pub fn begin_backup(&mut self) -> Result<BackupId> {
        self.ledger.begin()
    }

    /// Look up the node tracking `path`
    ///
    /// Paths known at load time resolve through the index; nodes created
    /// since then are found by walking the tree.
    pub fn node(&self, path: &Path) -> Option<&PathNode> {
        if let Some(chain) = self.index.get(path) {
            let mut nodes = &self.roots;
            let mut found: Option<&PathNode> = None;
            for &i in chain {
                let node = nodes.get(i)?;
                nodes = &node.subnodes;
                found = Some(node);
            }
            if let Some(node) = found {
                if node.path == path {
                    return Some(node);
                }
            }
        }

        let mut nodes = &self.roots;
        'walk: loop {
            for node in nodes {
                if node.path == path {
                    return Some(node);
                }
                if path.starts_with(&node.path) {
                    nodes = &node.subnodes;
                    continue 'walk;
                }
            }
            return None;
        }
    }

    /// Visit every node depth-first
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a PathNode)) {
        fn walk<'a>(nodes: &'a [PathNode], f: &mut dyn FnMut(&'a PathNode)) {
            for node in nodes {
                f(node);
                walk(&node.subnodes, f);
            }
        }
        walk(&self.roots, f);
    }

    /// Rebuild the transient path index from the tree
    pub(crate) fn rebuild_index(&mut self) {
        fn walk(
            nodes: &[PathNode],
            chain: &mut Vec<usize>,
            index: &mut HashMap<PathBuf, Vec<usize>>,
        ) {
            for (i, node) in nodes.iter().enumerate() {
                chain.push(i);
                index.insert(node.path.clone(), chain.clone());
                walk(&node.subnodes, chain, index);
                chain.pop();
            }
        }
        let mut index = std::mem::take(&mut self.index);
        index.clear();
        let mut chain = Vec::new();
        walk(&self.roots, &mut chain, &mut index);
        self.index = index;
        trace!("Rebuilt path index ({} entries)", self.index.len());
    }

    /// Verify the structural invariants
    ///
    /// Checks that backup ids ascend, that every history sequence ascends
    /// and is non-empty, that every referenced marker exists, and that each
    /// marker's reference count equals the number of points referencing it.
    pub fn verify(&self) -> Result<()> {
        for pair in self.ledger.completed.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(KeepsakeError::InvalidCatalog(format!(
                    "backup history not ascending at {}",
                    pair[1].id
                )));
            }
        }

        let mut refs: HashMap<BackupId, u64> = HashMap::new();
        let mut count_history = |history: &[HistoryPoint]| -> Result<()> {
            for pair in history.windows(2) {
                if pair[0].backup >= pair[1].backup {
                    return Err(KeepsakeError::InvalidCatalog(format!(
                        "history sequence not ascending at {}",
                        pair[1].backup
                    )));
                }
            }
            for point in history {
                *refs.entry(point.backup).or_insert(0) += 1;
            }
            Ok(())
        };

        count_history(&self.config_history)?;
        let mut stack: Vec<&PathNode> = self.roots.iter().collect();
        while let Some(node) = stack.pop() {
            if node.history.is_empty() {
                return Err(KeepsakeError::InvalidCatalog(format!(
                    "node {:?} has an empty history",
                    node.path
                )));
            }
            count_history(&node.history)?;
            stack.extend(node.subnodes.iter());
        }

        for (id, expected) in &refs {
            match self.ledger.get(*id) {
                None => {
                    return Err(KeepsakeError::InvalidCatalog(format!(
                        "history references unknown backup {}",
                        id
                    )))
                }
                Some(backup) if backup.ref_count != *expected => {
                    return Err(KeepsakeError::InvalidCatalog(format!(
                        "backup {} reference count is {} but {} points reference it",
                        id, backup.ref_count, expected
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

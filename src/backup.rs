//! Backup initiation and the finish phase
//!
//! A backup run has two deliberately separate phases:
//!
//! 1. [`initiate`] walks the search feed, creates or updates the catalog's
//!    path nodes, runs the change detector, and records hints. Hashing and
//!    repository writes are deferred, so a change summary can be shown to
//!    the user cheaply before any expensive work happens.
//! 2. [`finish`] stores content for every node flagged with content changes
//!    or newly added, records the tool's own config file in the config
//!    history, drops vanished transient paths, and commits the backup
//!    marker.
//!
//! An abandoned run costs nothing: the catalog is only persisted after the
//! finish phase, so dropping the in-memory tree discards the half-done run.
//!
//! The feed's recursion and the tree's recursion move in lock-step: a
//! directory result opens a level that is consumed until the matching
//! `EndOfDirectory` sentinel, and subnodes the feed never mentioned at that
//! level are swept as removed.

use crate::detect;
use crate::error::{KeepsakeError, Result};
use crate::hint::{ChangeFlag, HintStatus, PolicyFlag};
use crate::scan::SearchFeed;
use crate::storage::Repository;
use crate::tree::{push_point, refresh_point, BackupLedger, Catalog, HistoryPoint, PathNode};
use crate::types::{
    BackupId, BackupSummary, ContentDigest, PathKind, PathState, Policy, RegularFileInfo,
    SearchEntry, SearchResult,
};
use crate::utils;
use std::path::Path;
use tracing::{debug, info, trace};

/// Walk the search feed and record what changed
///
/// Opens the current backup marker and mutates the tree: new paths become
/// nodes with a single `Added` history point, known paths are compared by
/// the change detector and their hints merged. Content hashing is deferred
/// wherever possible (see [`crate::detect`]).
///
/// Returns a summary of the hints for the caller to review before
/// confirming with [`finish`].
///
/// # Errors
///
/// - [`KeepsakeError::BackupInProgress`] if a run is already open
/// - [`KeepsakeError::FeedProtocol`] on unbalanced feed sentinels
/// - any detector or filesystem error
pub fn initiate(catalog: &mut Catalog, feed: &mut dyn SearchFeed) -> Result<BackupSummary> {
    let backup = catalog.begin_backup()?;
    info!("Initiating backup {}", backup);

    let mut created = 0u64;
    consume_level(
        feed,
        &mut catalog.roots,
        &mut catalog.ledger,
        backup,
        true,
        &mut created,
    )?;
    sweep_removed(&mut catalog.roots, &mut catalog.ledger, backup)?;
    catalog.total_paths += created;

    let summary = tally_hints(catalog);
    debug!(
        "Backup {} initiated: {} added, {} changed, {} removed, {} unchanged",
        backup,
        summary.paths_added,
        summary.paths_changed,
        summary.paths_removed,
        summary.paths_unchanged
    );
    Ok(summary)
}

/// Store deferred content, track the config file, and commit the backup
///
/// For every node whose hint requires content and whose latest state is a
/// regular file: content at or below the digest length is embedded
/// literally (with the end-of-file race check), larger content is hashed —
/// unless the detector already computed a fresh hash — and inserted into
/// the repository, recording the allocated slot. Transient nodes whose
/// latest state is `NonExisting` are dropped with every reference they
/// held. Finally the current marker is stamped and merged into the history.
///
/// The caller persists the catalog afterwards.
pub fn finish(
    catalog: &mut Catalog,
    repo: &Repository,
    config_path: Option<&Path>,
) -> Result<BackupSummary> {
    let backup = catalog
        .ledger
        .current_id()
        .ok_or(KeepsakeError::NoBackupInProgress)?;

    let mut summary = tally_hints(catalog);
    store_level(&mut catalog.roots, repo, &mut summary)?;

    if let Some(config) = config_path {
        record_config(
            &mut catalog.config_history,
            &mut catalog.ledger,
            repo,
            config,
            backup,
            &mut summary,
        )?;
    }

    let dropped = drop_vanished_transients(&mut catalog.roots, &mut catalog.ledger)?;
    if dropped > 0 {
        catalog.total_paths = catalog.total_paths.saturating_sub(dropped as u64);
        catalog.rebuild_index();
    }

    catalog.ledger.finalize()?;
    summary.backup = Some(backup);
    info!(
        "Backup {} committed: {} objects stored ({})",
        backup,
        summary.objects_stored,
        utils::format_bytes(summary.bytes_stored)
    );
    Ok(summary)
}

/// Consume one feed level into one sibling list, recursing in lock-step
fn consume_level(
    feed: &mut dyn SearchFeed,
    nodes: &mut Vec<PathNode>,
    ledger: &mut BackupLedger,
    backup: BackupId,
    top_level: bool,
    created: &mut u64,
) -> Result<()> {
    loop {
        let (entry, is_directory) = match feed.next_result()? {
            SearchResult::EndOfSearch => {
                if !top_level {
                    return Err(KeepsakeError::FeedProtocol(
                        "end of search inside a directory".into(),
                    ));
                }
                return Ok(());
            }
            SearchResult::EndOfDirectory => {
                if top_level {
                    return Err(KeepsakeError::FeedProtocol(
                        "unmatched end-of-directory sentinel".into(),
                    ));
                }
                return Ok(());
            }
            SearchResult::Directory(entry) => (entry, true),
            SearchResult::Regular(entry) | SearchResult::Symlink(entry) => (entry, false),
            SearchResult::Other(entry) => (entry, false),
        };

        let idx = match apply_entry(nodes, ledger, backup, &entry, created)? {
            Some(idx) => idx,
            None => continue,
        };

        if is_directory {
            // mirror the feed's recursion until its EndOfDirectory, then
            // sweep children the feed never mentioned
            consume_level(
                feed,
                &mut nodes[idx].subnodes,
                ledger,
                backup,
                false,
                created,
            )?;
            sweep_removed(&mut nodes[idx].subnodes, ledger, backup)?;
        } else if !nodes[idx].subnodes.is_empty() {
            // the path is no longer a directory; its children are gone
            sweep_removed(&mut nodes[idx].subnodes, ledger, backup)?;
        }
    }
}

/// Create or update the node for one feed entry
///
/// Returns the node's index in the sibling list, or `None` when the entry
/// was skipped (a new path of a kind the repository cannot store).
fn apply_entry(
    nodes: &mut Vec<PathNode>,
    ledger: &mut BackupLedger,
    backup: BackupId,
    entry: &SearchEntry,
    created: &mut u64,
) -> Result<Option<usize>> {
    if let Some(idx) = nodes.iter().position(|n| n.path == entry.path) {
        update_node(&mut nodes[idx], ledger, backup, entry)?;
        return Ok(Some(idx));
    }

    if entry.stat.kind == PathKind::Other {
        debug!("Skipping unstorable entry {:?}", entry.path);
        return Ok(None);
    }

    let detection = detect::detect(&entry.path, &PathState::NonExisting, &entry.stat)?;
    let previous = ledger.latest().map(|b| b.id);
    let mut node = match previous {
        // anchor the path's absence at the preceding backup so forward
        // resolution against older snapshots answers NonExisting
        Some(previous) if entry.policy.retains_history() => {
            let mut node = PathNode::new(
                entry.path.clone(),
                entry.policy,
                ledger,
                previous,
                PathState::NonExisting,
            )?;
            node.push_state(ledger, backup, detection.state)?;
            node
        }
        _ => PathNode::new(
            entry.path.clone(),
            entry.policy,
            ledger,
            backup,
            detection.state,
        )?,
    };
    node.hint = detection.hint;
    *created += 1;
    trace!("Added node {:?}", entry.path);
    nodes.push(node);
    Ok(Some(nodes.len() - 1))
}

/// Run the change detector against a known node and record the outcome
fn update_node(
    node: &mut PathNode,
    ledger: &mut BackupLedger,
    backup: BackupId,
    entry: &SearchEntry,
) -> Result<()> {
    if node.policy != entry.policy {
        node.hint.add_policy(PolicyFlag::PolicyChanged);
        if node.policy.retains_history() && !entry.policy.retains_history() {
            node.hint.add_policy(PolicyFlag::LosesHistory);
        }
        debug!(
            "Policy of {:?} changed: {} -> {}",
            node.path, node.policy, entry.policy
        );
        node.policy = entry.policy;
    }

    let last_state = node
        .latest()
        .map(|p| p.state.clone())
        .ok_or_else(|| KeepsakeError::InvalidCatalog(format!("node {:?} has no history", node.path)))?;
    let detection = detect::detect(&node.path, &last_state, &entry.stat)?;

    if detection.hint.is_interesting() {
        if node.policy.retains_history() {
            node.push_state(ledger, backup, detection.state)?;
        } else {
            node.replace_latest(ledger, backup, detection.state)?;
        }
    } else {
        node.refresh_marker(ledger, backup)?;
    }
    node.hint.merge_from(detection.hint);

    // the policy stopped retaining history: drop everything but the newest
    // point now that it is recorded
    if node.hint.has_policy(PolicyFlag::LosesHistory) && node.history.len() > 1 {
        let dropped = node.trim_to_latest(ledger)?;
        debug!("Trimmed {} history points from {:?}", dropped, node.path);
    }

    Ok(())
}

/// Mark every untouched, still-present node in a sibling list as removed
fn sweep_removed(
    nodes: &mut [PathNode],
    ledger: &mut BackupLedger,
    backup: BackupId,
) -> Result<()> {
    for node in nodes {
        if node.hint.is_empty() {
            mark_removed(node, ledger, backup)?;
        }
    }
    Ok(())
}

/// Record a `NonExisting` state for a vanished node and its subtree
fn mark_removed(node: &mut PathNode, ledger: &mut BackupLedger, backup: BackupId) -> Result<()> {
    let was_present = node
        .latest()
        .map(|p| p.state != PathState::NonExisting)
        .unwrap_or(false);
    if was_present {
        node.hint.set_status(HintStatus::Removed);
        if node.policy.retains_history() {
            node.push_state(ledger, backup, PathState::NonExisting)?;
        } else {
            node.replace_latest(ledger, backup, PathState::NonExisting)?;
        }
        trace!("Marked {:?} removed", node.path);
    }
    for sub in &mut node.subnodes {
        if sub.hint.is_empty() {
            mark_removed(sub, ledger, backup)?;
        }
    }
    Ok(())
}

/// Aggregate the hints currently recorded on the tree
fn tally_hints(catalog: &Catalog) -> BackupSummary {
    let mut summary = BackupSummary::default();
    catalog.visit(&mut |node| {
        if node.hint.is_empty() {
            return;
        }
        match node.hint.status() {
            HintStatus::Unchanged => summary.paths_unchanged += 1,
            HintStatus::Added => summary.paths_added += 1,
            HintStatus::Removed => summary.paths_removed += 1,
            _ => summary.paths_changed += 1,
        }
    });
    summary
}

/// Store deferred content for a sibling list, depth first
fn store_level(
    nodes: &mut [PathNode],
    repo: &Repository,
    summary: &mut BackupSummary,
) -> Result<()> {
    for node in nodes {
        if node.hint.needs_content() {
            let fresh_hash = node.hint.has_change(ChangeFlag::FreshHashComputed);
            if let Some(point) = node.history.last_mut() {
                if let PathState::Regular { info, .. } = &mut point.state {
                    store_content(&node.path, info, fresh_hash, repo, summary)?;
                }
            }
        }
        store_level(&mut node.subnodes, repo, summary)?;
    }
    Ok(())
}

/// Fill in a regular file's digest and persist its content if needed
///
/// Small files embed their literal bytes; no repository object is created
/// for them. `fresh_hash` skips the hashing pass when the detector already
/// recomputed the digest.
fn store_content(
    path: &Path,
    info: &mut RegularFileInfo,
    fresh_hash: bool,
    repo: &Repository,
    summary: &mut BackupSummary,
) -> Result<()> {
    if info.is_embedded() {
        info.digest = if info.size == 0 {
            ContentDigest::ZERO
        } else {
            utils::read_embedded(path, info.size)?
        };
        info.slot = 0;
        return Ok(());
    }

    if !fresh_hash {
        let stat = utils::file_stat(path)?;
        info.digest = utils::hash_file_streaming(path, stat.block_size)?;
    }
    let outcome = repo.insert(path, &info.digest, info.size)?;
    info.slot = outcome.slot;
    if outcome.written {
        summary.objects_stored += 1;
        summary.bytes_stored += info.size;
    }
    Ok(())
}

/// Track the tool's own config file in the config history
///
/// The config file is handled exactly like a regular path: unchanged runs
/// move the newest marker forward, changes append a new point with the
/// content stored or embedded.
fn record_config(
    config_history: &mut Vec<HistoryPoint>,
    ledger: &mut BackupLedger,
    repo: &Repository,
    config: &Path,
    backup: BackupId,
    summary: &mut BackupSummary,
) -> Result<()> {
    let stat = utils::file_stat(config)?;
    let last = config_history
        .last()
        .map(|p| p.state.clone())
        .unwrap_or(PathState::NonExisting);
    let detection = detect::detect(config, &last, &stat)?;

    if detection.hint.is_interesting() {
        let mut state = detection.state;
        if let PathState::Regular { info, .. } = &mut state {
            let fresh_hash = detection.hint.has_change(ChangeFlag::FreshHashComputed);
            store_content(config, info, fresh_hash, repo, summary)?;
        }
        push_point(config_history, ledger, backup, state)?;
        debug!("Recorded config change from {:?}", config);
    } else {
        refresh_point(config_history, ledger, backup)?;
    }
    Ok(())
}

/// Drop transient nodes whose latest state is `NonExisting`
///
/// Returns the number of nodes removed; every reference they held is
/// released so the external garbage collector sees exact counts.
fn drop_vanished_transients(nodes: &mut Vec<PathNode>, ledger: &mut BackupLedger) -> Result<usize> {
    let mut dropped = 0;
    let mut i = 0;
    while i < nodes.len() {
        let vanished = nodes[i].policy == Policy::Transient
            && matches!(
                nodes[i].latest().map(|p| &p.state),
                Some(PathState::NonExisting)
            );
        if vanished {
            let node = nodes.remove(i);
            node.release_subtree(ledger)?;
            dropped += count_nodes(&node);
            debug!("Forgot vanished transient path {:?}", node.path);
        } else {
            dropped += drop_vanished_transients(&mut nodes[i].subnodes, ledger)?;
            i += 1;
        }
    }
    Ok(dropped)
}

fn count_nodes(node: &PathNode) -> usize {
    1 + node.subnodes.iter().map(count_nodes).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::FsSearch;
    use std::fs;
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

    fn run_backup(fx: &mut Fixture, policy: Policy) -> BackupSummary {
        let mut feed = FsSearch::new(vec![(fx.root.clone(), policy)], &[]).unwrap();
        initiate(&mut fx.catalog, &mut feed).unwrap();
        let summary = finish(&mut fx.catalog, &fx.repo, None).unwrap();
        clear_hints(&mut fx.catalog.roots);
        summary
    }

    /// Reset transient hints between runs, as separate invocations would
    fn clear_hints(nodes: &mut [PathNode]) {
        for node in nodes {
            node.hint = crate::hint::Hint::none();
            clear_hints(&mut node.subnodes);
        }
    }

    #[test]
    fn test_first_backup_adds_small_file_without_storing() {
        let mut fx = fixture();
        fs::write(fx.root.join("dummy.txt"), b"dummy").unwrap();

        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Copy)], &[]).unwrap();
        let summary = initiate(&mut fx.catalog, &mut feed).unwrap();
        assert_eq!(summary.paths_added, 2); // the root directory and the file

        // the file node reports Added with a deferred hash
        let node = fx.catalog.node(&fx.root.join("dummy.txt")).unwrap();
        assert_eq!(node.hint.status(), HintStatus::Added);
        assert!(!node.hint.has_change(ChangeFlag::FreshHashComputed));

        let summary = finish(&mut fx.catalog, &fx.repo, None).unwrap();
        assert_eq!(summary.backup, Some(BackupId(1)));
        // 5 bytes fit inside the digest: embedded, no repository object
        assert_eq!(summary.objects_stored, 0);
        let node = fx.catalog.node(&fx.root.join("dummy.txt")).unwrap();
        match &node.latest().unwrap().state {
            PathState::Regular { info, .. } => {
                assert_eq!(info.digest.embedded_bytes(5), b"dummy");
            }
            other => panic!("expected regular state, got {:?}", other),
        }
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_first_backup_stores_large_file_once() {
        let mut fx = fixture();
        let content = vec![0x42u8; 4096];
        fs::write(fx.root.join("big.bin"), &content).unwrap();

        let summary = run_backup(&mut fx, Policy::Copy);
        assert_eq!(summary.objects_stored, 1);
        assert_eq!(summary.bytes_stored, 4096);

        let node = fx.catalog.node(&fx.root.join("big.bin")).unwrap();
        match &node.latest().unwrap().state {
            PathState::Regular { info, .. } => {
                assert_eq!(info.digest, ContentDigest::hash_bytes(&content));
                assert!(fx.repo.exists(&info.digest, info.size, info.slot));
            }
            other => panic!("expected regular state, got {:?}", other),
        }
    }

    #[test]
    fn test_unchanged_backup_moves_marker_forward() {
        let mut fx = fixture();
        fs::write(fx.root.join("stable.txt"), b"stable").unwrap();

        run_backup(&mut fx, Policy::Copy);
        let summary = run_backup(&mut fx, Policy::Copy);

        assert_eq!(summary.paths_unchanged, 2);
        assert!(!summary.has_changes());

        // single history point, now referencing backup 2
        let node = fx.catalog.node(&fx.root.join("stable.txt")).unwrap();
        assert_eq!(node.history.len(), 1);
        assert_eq!(node.history[0].backup, BackupId(2));
        // backup 1 drained to zero references
        assert_eq!(fx.catalog.ledger.get(BackupId(1)).unwrap().ref_count, 0);
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_timestamp_only_change_is_not_content_change() {
        let mut fx = fixture();
        let file = fx.root.join("touched.txt");
        fs::write(&file, b"same bytes").unwrap();

        run_backup(&mut fx, Policy::Copy);

        let old = utils::file_stat(&file).unwrap();
        utils::set_modified(&file, old.modified + chrono::Duration::seconds(30)).unwrap();

        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Copy)], &[]).unwrap();
        initiate(&mut fx.catalog, &mut feed).unwrap();

        let node = fx.catalog.node(&file).unwrap();
        assert!(node.hint.has_change(ChangeFlag::TimestampChanged));
        assert!(!node.hint.has_change(ChangeFlag::ContentChanged));
    }

    #[test]
    fn test_modified_file_appends_history_point() {
        let mut fx = fixture();
        let file = fx.root.join("evolving.txt");
        fs::write(&file, b"first version").unwrap();

        run_backup(&mut fx, Policy::Copy);
        fs::write(&file, b"second version, somewhat longer").unwrap();
        run_backup(&mut fx, Policy::Copy);

        let node = fx.catalog.node(&file).unwrap();
        assert_eq!(node.history.len(), 2);
        assert_eq!(node.history[0].backup, BackupId(1));
        assert_eq!(node.history[1].backup, BackupId(2));
        match &node.history[0].state {
            PathState::Regular { info, .. } => {
                assert_eq!(info.digest.embedded_bytes(13), b"first version")
            }
            other => panic!("expected regular state, got {:?}", other),
        }
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_mirror_policy_keeps_single_point() {
        let mut fx = fixture();
        let file = fx.root.join("latest-only.txt");
        fs::write(&file, b"one").unwrap();

        run_backup(&mut fx, Policy::Mirror);
        fs::write(&file, b"two, but longer").unwrap();
        run_backup(&mut fx, Policy::Mirror);

        let node = fx.catalog.node(&file).unwrap();
        assert_eq!(node.history.len(), 1);
        assert_eq!(node.history[0].backup, BackupId(2));
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_removed_path_gets_nonexisting_point() {
        let mut fx = fixture();
        let file = fx.root.join("fleeting.txt");
        fs::write(&file, b"here today").unwrap();

        run_backup(&mut fx, Policy::Copy);
        fs::remove_file(&file).unwrap();

        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Copy)], &[]).unwrap();
        let summary = initiate(&mut fx.catalog, &mut feed).unwrap();
        assert_eq!(summary.paths_removed, 1);

        let node = fx.catalog.node(&file).unwrap();
        assert_eq!(node.hint.status(), HintStatus::Removed);
        assert_eq!(node.history.len(), 2);
        assert_eq!(node.latest().unwrap().state, PathState::NonExisting);

        finish(&mut fx.catalog, &fx.repo, None).unwrap();
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_policy_change_to_mirror_loses_history() {
        let mut fx = fixture();
        let file = fx.root.join("demoted.txt");
        fs::write(&file, b"v1").unwrap();

        run_backup(&mut fx, Policy::Copy);
        fs::write(&file, b"v2 with more bytes").unwrap();
        run_backup(&mut fx, Policy::Copy);

        let node = fx.catalog.node(&file).unwrap();
        assert_eq!(node.history.len(), 2);

        // same tree, now scanned under a latest-only policy
        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Mirror)], &[]).unwrap();
        initiate(&mut fx.catalog, &mut feed).unwrap();

        let node = fx.catalog.node(&file).unwrap();
        assert!(node.hint.has_policy(PolicyFlag::PolicyChanged));
        assert!(node.hint.has_policy(PolicyFlag::LosesHistory));
        assert_eq!(node.history.len(), 1);

        finish(&mut fx.catalog, &fx.repo, None).unwrap();
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_vanished_transient_path_is_forgotten() {
        let mut fx = fixture();
        let file = fx.root.join("scratch.txt");
        fs::write(&file, b"temporary").unwrap();

        run_backup(&mut fx, Policy::Transient);
        assert!(fx.catalog.node(&file).is_some());

        fs::remove_file(&file).unwrap();
        run_backup(&mut fx, Policy::Transient);

        assert!(fx.catalog.node(&file).is_none());
        fx.catalog.verify().unwrap();
    }

    #[test]
    fn test_config_history_is_tracked() {
        let mut fx = fixture();
        fs::write(fx.root.join("f.txt"), b"x").unwrap();
        let config = fx._temp.path().join("config.json");
        fs::write(&config, b"{\"roots\":[]}").unwrap();

        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Copy)], &[]).unwrap();
        initiate(&mut fx.catalog, &mut feed).unwrap();
        finish(&mut fx.catalog, &fx.repo, Some(&config)).unwrap();
        clear_hints(&mut fx.catalog.roots);

        assert_eq!(fx.catalog.config_history.len(), 1);
        assert_eq!(fx.catalog.config_history[0].backup, BackupId(1));

        // unchanged config: the marker moves forward
        let mut feed = FsSearch::new(vec![(fx.root.clone(), Policy::Copy)], &[]).unwrap();
        initiate(&mut fx.catalog, &mut feed).unwrap();
        finish(&mut fx.catalog, &fx.repo, Some(&config)).unwrap();

        assert_eq!(fx.catalog.config_history.len(), 1);
        assert_eq!(fx.catalog.config_history[0].backup, BackupId(2));
        fx.catalog.verify().unwrap();
    }
}

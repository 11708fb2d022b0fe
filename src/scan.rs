//! Filesystem search feed
//!
//! The backup initiator consumes a stream of [`SearchResult`] records; this
//! module produces that stream from the live filesystem. Each configured
//! root carries a retention policy that is attached to every entry found
//! below it. Directories are emitted before their children and closed by an
//! `EndOfDirectory` sentinel, so the consumer's tree recursion can stay in
//! lock-step with the feed's own recursion; the whole walk is closed by
//! `EndOfSearch`.
//!
//! Entries within a directory are emitted in name order so change summaries
//! are stable between runs.

use crate::error::{KeepsakeError, Result};
use crate::types::{PathKind, Policy, SearchEntry, SearchResult};
use crate::utils;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Producer side of the search feed
///
/// The backup initiator is written against this trait; the filesystem
/// implementation below is the production feed, and tests may substitute
/// scripted feeds.
pub trait SearchFeed {
    /// Yield the next record of the stream
    fn next_result(&mut self) -> Result<SearchResult>;
}

/// One directory level being traversed
struct Frame {
    entries: std::vec::IntoIter<PathBuf>,
    policy: Policy,
}

/// Search feed over the live filesystem
pub struct FsSearch {
    pending_roots: VecDeque<(PathBuf, Policy)>,
    frames: Vec<Frame>,
    excludes: GlobSet,
    finished: bool,
}

impl FsSearch {
    /// Build a feed over the configured roots
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::InvalidPattern`] for an unparsable exclude glob
    pub fn new(roots: Vec<(PathBuf, Policy)>, excludes: &[String]) -> Result<FsSearch> {
        let mut builder = GlobSetBuilder::new();
        for pattern in excludes {
            let glob = Glob::new(pattern)
                .map_err(|e| KeepsakeError::InvalidPattern(format!("{}: {}", pattern, e)))?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| KeepsakeError::InvalidPattern(e.to_string()))?;

        Ok(FsSearch {
            pending_roots: roots.into(),
            frames: Vec::new(),
            excludes,
            finished: false,
        })
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.excludes.is_match(path) {
            return true;
        }
        path.file_name()
            .map(|name| self.excludes.is_match(Path::new(name)))
            .unwrap_or(false)
    }

    /// Stat and classify one entry, opening a frame for directories
    fn emit(&mut self, path: PathBuf, policy: Policy) -> Result<SearchResult> {
        let stat = utils::file_stat(&path)?;
        if stat.kind == PathKind::Directory {
            let mut children: Vec<PathBuf> = fs::read_dir(&path)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            children.sort();
            self.frames.push(Frame {
                entries: children.into_iter(),
                policy,
            });
        }

        let entry = SearchEntry { path, policy, stat };
        Ok(match stat.kind {
            PathKind::Regular => SearchResult::Regular(entry),
            PathKind::Symlink => SearchResult::Symlink(entry),
            PathKind::Directory => SearchResult::Directory(entry),
            PathKind::Other => SearchResult::Other(entry),
        })
    }
}

impl SearchFeed for FsSearch {
    fn next_result(&mut self) -> Result<SearchResult> {
        if self.finished {
            return Ok(SearchResult::EndOfSearch);
        }
        loop {
            let from_frame = self
                .frames
                .last_mut()
                .map(|frame| (frame.entries.next(), frame.policy));

            match from_frame {
                Some((Some(path), policy)) => {
                    if self.is_excluded(&path) {
                        debug!("Excluded {:?}", path);
                        continue;
                    }
                    return self.emit(path, policy);
                }
                Some((None, _)) => {
                    self.frames.pop();
                    return Ok(SearchResult::EndOfDirectory);
                }
                None => match self.pending_roots.pop_front() {
                    Some((path, policy)) => {
                        if !path.exists() {
                            warn!("Backup root {:?} does not exist, skipping", path);
                            continue;
                        }
                        return self.emit(path, policy);
                    }
                    None => {
                        self.finished = true;
                        return Ok(SearchResult::EndOfSearch);
                    }
                },
            }
        }
    }
}

//! Change hints recorded on path nodes during a backup run
//!
//! A [`Hint`] is a transient, in-memory-only annotation describing what
//! changed for a path during the current run. It is organized into three
//! independent tiers that compose without clobbering each other:
//!
//! 1. **Status** — mutually exclusive, exactly one active value: unchanged,
//!    added, removed, not part of the repository, or one of the six ordered
//!    type transitions among regular/symlink/directory.
//! 2. **Change flags** — independently combinable bits for owner,
//!    permission, timestamp and content changes, plus a marker that a fresh
//!    hash was already computed.
//! 3. **Policy flags** — independently combinable bits for retention-policy
//!    drift.
//!
//! Every mutation is a targeted merge into exactly one tier: statuses
//! replace one another, flags accumulate by OR. Setting any status clears
//! the change-flag tier (a coarse status supersedes fine-grained flags);
//! setting [`HintStatus::Unchanged`] clears the policy tier as well, since
//! nothing may coexist with it. Adding a flag to an `Unchanged` hint first
//! demotes the status back to `None`.

use std::fmt;

/// Status tier of a [`Hint`] — exactly one value is active at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HintStatus {
    /// No status recorded (flags may still carry information)
    #[default]
    None,
    /// Nothing about the path changed
    Unchanged,
    /// The path is new to the catalog
    Added,
    /// The path disappeared from the filesystem
    Removed,
    /// The path exists but is of a kind the repository cannot store
    NotPartOfRepository,
    /// A regular file became a symlink
    RegularToSymlink,
    /// A regular file became a directory
    RegularToDirectory,
    /// A symlink became a regular file
    SymlinkToRegular,
    /// A symlink became a directory
    SymlinkToDirectory,
    /// A directory became a regular file
    DirectoryToRegular,
    /// A directory became a symlink
    DirectoryToSymlink,
}

impl HintStatus {
    /// Whether this status replaces the path's content wholesale, so that
    /// the finish phase must (re)store a regular file's bytes
    pub fn replaces_content(self) -> bool {
        matches!(
            self,
            HintStatus::Added | HintStatus::SymlinkToRegular | HintStatus::DirectoryToRegular
        )
    }

    /// Short human-readable label used in change summaries
    pub fn label(self) -> &'static str {
        match self {
            HintStatus::None => "",
            HintStatus::Unchanged => "unchanged",
            HintStatus::Added => "added",
            HintStatus::Removed => "removed",
            HintStatus::NotPartOfRepository => "not storable",
            HintStatus::RegularToSymlink => "file -> symlink",
            HintStatus::RegularToDirectory => "file -> directory",
            HintStatus::SymlinkToRegular => "symlink -> file",
            HintStatus::SymlinkToDirectory => "symlink -> directory",
            HintStatus::DirectoryToRegular => "directory -> file",
            HintStatus::DirectoryToSymlink => "directory -> symlink",
        }
    }
}

/// Change-flag tier bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeFlag {
    /// uid or gid differs
    OwnerChanged = 1 << 0,
    /// Permission bits differ
    PermissionsChanged = 1 << 1,
    /// Modification time differs
    TimestampChanged = 1 << 2,
    /// Content differs
    ContentChanged = 1 << 3,
    /// A fresh content digest was already computed during detection, so the
    /// finish phase can skip rehashing
    FreshHashComputed = 1 << 4,
}

impl ChangeFlag {
    /// Every change-tier flag
    pub const ALL: [ChangeFlag; 5] = [
        ChangeFlag::OwnerChanged,
        ChangeFlag::PermissionsChanged,
        ChangeFlag::TimestampChanged,
        ChangeFlag::ContentChanged,
        ChangeFlag::FreshHashComputed,
    ];
}

/// Policy-flag tier bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PolicyFlag {
    /// The retention policy applied to the path changed
    PolicyChanged = 1 << 0,
    /// The policy change discards previously recorded history
    LosesHistory = 1 << 1,
}

impl PolicyFlag {
    /// Every policy-tier flag
    pub const ALL: [PolicyFlag; 2] = [PolicyFlag::PolicyChanged, PolicyFlag::LosesHistory];
}

/// Transient annotation describing what changed for a path this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hint {
    status: HintStatus,
    changes: u8,
    policy: u8,
}

impl Hint {
    /// A hint with no information recorded
    pub fn none() -> Hint {
        Hint::default()
    }

    /// Active status-tier value
    pub fn status(&self) -> HintStatus {
        self.status
    }

    /// Replace the status-tier value
    ///
    /// Clears the change-flag tier; `Unchanged` also clears the policy tier
    /// since no other hint information may coexist with it.
    pub fn set_status(&mut self, status: HintStatus) {
        self.status = status;
        self.changes = 0;
        if status == HintStatus::Unchanged {
            self.policy = 0;
        }
    }

    /// Accumulate a change-tier flag
    pub fn add_change(&mut self, flag: ChangeFlag) {
        if self.status == HintStatus::Unchanged {
            self.status = HintStatus::None;
        }
        self.changes |= flag as u8;
    }

    /// Accumulate a policy-tier flag
    pub fn add_policy(&mut self, flag: PolicyFlag) {
        if self.status == HintStatus::Unchanged {
            self.status = HintStatus::None;
        }
        self.policy |= flag as u8;
    }

    /// Whether a change-tier flag is set
    pub fn has_change(&self, flag: ChangeFlag) -> bool {
        self.changes & flag as u8 != 0
    }

    /// Whether a policy-tier flag is set
    pub fn has_policy(&self, flag: PolicyFlag) -> bool {
        self.policy & flag as u8 != 0
    }

    /// Whether no information has been recorded at all
    ///
    /// Distinct from `Unchanged`: an untouched node carries an empty hint,
    /// a visited-but-identical node carries `Unchanged`.
    pub fn is_empty(&self) -> bool {
        *self == Hint::default()
    }

    /// Whether the hint records any difference worth reporting
    pub fn is_interesting(&self) -> bool {
        !self.is_empty() && self.status != HintStatus::Unchanged
    }

    /// Whether the finish phase must store content for this path
    pub fn needs_content(&self) -> bool {
        self.status.replaces_content() || self.has_change(ChangeFlag::ContentChanged)
    }

    /// Merge another hint into this one, tier by tier
    ///
    /// Used to fold a detector result into a node hint that may already
    /// carry policy flags: a real status replaces the status tier, flags
    /// accumulate, and `Unchanged` is only adopted when nothing else has
    /// been recorded (it may not coexist with any other information).
    pub fn merge_from(&mut self, other: Hint) {
        match other.status() {
            HintStatus::None => {}
            HintStatus::Unchanged => {
                if self.is_empty() {
                    self.set_status(HintStatus::Unchanged);
                }
            }
            status => self.set_status(status),
        }
        for flag in ChangeFlag::ALL {
            if other.has_change(flag) {
                self.add_change(flag);
            }
        }
        for flag in PolicyFlag::ALL {
            if other.has_policy(flag) {
                self.add_policy(flag);
            }
        }
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        if self.status != HintStatus::None {
            parts.push(self.status.label());
        }
        if self.has_change(ChangeFlag::OwnerChanged) {
            parts.push("owner");
        }
        if self.has_change(ChangeFlag::PermissionsChanged) {
            parts.push("permissions");
        }
        if self.has_change(ChangeFlag::TimestampChanged) {
            parts.push("timestamp");
        }
        if self.has_change(ChangeFlag::ContentChanged) {
            parts.push("content");
        }
        if self.has_policy(PolicyFlag::PolicyChanged) {
            parts.push("policy");
        }
        if self.has_policy(PolicyFlag::LosesHistory) {
            parts.push("loses history");
        }
        f.write_str(&parts.join(", "))
    }
}

//! Immutable, process-wide configuration threaded through the call graph.
//!
//! Per the design notes, feature flags, dry-run mode, thread count, and
//! the orphanage path must never live behind a global mutable static —
//! every phase and worker receives a reference (or an `Arc` clone) of
//! one [`RepairContext`] built once at startup.

use std::sync::atomic::{AtomicU32, Ordering};

/// Selects how an inode record stores the set of directories that claim
/// it as a child while phase 3/6 are still discovering parents.
///
/// The selection is made once per run, before any [`crate::incore::inode_tree::InodeTree`]
/// allocation, and never flipped — see design notes on "manual
/// parent-pointer lists".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentsMode {
    /// Every inode may have at most one parent; a conflicting second
    /// parent is a logical inconsistency recorded immediately.
    Single,
    /// An inode may accumulate multiple candidate parents; phase 6
    /// picks (or orphans) among them.
    Many,
}

/// Feature bits a run may be asked to stage (see phase 1). None of
/// these are committed until later phases confirm no space shortfall
/// and no root-inode relocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureUpgrade {
    pub inode_btree_counts: bool,
    pub large_timestamps: bool,
    pub extent_counts_64: bool,
    pub file_content_exchange: bool,
}

impl FeatureUpgrade {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.inode_btree_counts
            || self.large_timestamps
            || self.extent_counts_64
            || self.file_content_exchange
    }
}

/// Process-wide, read-only repair configuration.
#[derive(Debug, Clone)]
pub struct RepairContext {
    /// `-n`: log corrections as "would ..." and never write.
    pub dry_run: bool,
    /// `-L`: destroy the journal instead of requiring a clean replay.
    pub destroy_log: bool,
    /// `-P`: force single-threaded operation regardless of hardware.
    pub single_threaded: bool,
    /// `-f`: force repair of an already-unmounted image.
    pub force: bool,
    /// `-t`: record per-phase wall-clock time in the returned report.
    pub time_phases: bool,
    /// Upper bound on worker pool size; ignored when `single_threaded`.
    pub thread_count: usize,
    /// Name of the lost+found directory created under the root.
    pub orphanage_name: &'static str,
    /// Feature bits staged by the user for this run (phase 1).
    pub feature_upgrade: FeatureUpgrade,
    /// Parent-tracking strategy, fixed for the run's lifetime.
    pub parents_mode: ParentsMode,
    /// Per-kind error-count threshold before a global abort is raised.
    pub error_threshold: u32,
    /// Upper bound on repeated "uncertain inode" passes in phase 3,
    /// guarding against the undocumented pass limit called out in the
    /// design notes.
    pub max_uncertain_passes: u32,
}

impl Default for RepairContext {
    fn default() -> Self {
        RepairContext {
            dry_run: false,
            destroy_log: false,
            single_threaded: false,
            force: false,
            time_phases: false,
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            orphanage_name: "lost+found",
            feature_upgrade: FeatureUpgrade::none(),
            parents_mode: ParentsMode::Single,
            error_threshold: 10_000,
            max_uncertain_passes: 64,
        }
    }
}

impl RepairContext {
    pub fn dry_run(mut self, v: bool) -> Self {
        self.dry_run = v;
        self
    }

    pub fn destroy_log(mut self, v: bool) -> Self {
        self.destroy_log = v;
        self
    }

    pub fn single_threaded(mut self, v: bool) -> Self {
        self.single_threaded = v;
        self
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n.max(1);
        self
    }

    pub fn effective_threads(&self) -> usize {
        if self.single_threaded { 1 } else { self.thread_count.max(1) }
    }
}

/// One-time-initialized string interning table for diagnostic labels —
/// the single global mutable state the design notes permit, since it
/// carries no decision-relevant configuration, only static rule names.
pub struct RuleLabels;

impl RuleLabels {
    /// Stable label for a correction rule, used verbatim in
    /// [`crate::diag::Correction`] output.
    pub const BAD_MAGIC: &'static str = "bad-magic";
    pub const MODE_FORMAT_MISMATCH: &'static str = "mode-format-mismatch";
    pub const FLAG_UNSUPPORTED: &'static str = "flag-unsupported";
    pub const EXTENT_SIZE_HINT: &'static str = "extent-size-hint";
    pub const NSEC_OVERFLOW: &'static str = "nsec-overflow";
    pub const NEXTENTS_MISMATCH: &'static str = "nextents-mismatch";
    pub const NBLOCKS_MISMATCH: &'static str = "nblocks-mismatch";
    pub const DUP_EXTENT: &'static str = "duplicate-extent";
    pub const RESERVED_BLOCK_CLAIM: &'static str = "reserved-block-claim";
    pub const DIR_ENTRY_DROPPED: &'static str = "dir-entry-dropped";
    pub const DIR_REBUILT: &'static str = "dir-rebuilt";
    pub const MISSING_DOT: &'static str = "missing-dot";
    pub const MISSING_DOTDOT: &'static str = "missing-dotdot";
    pub const RMAP_MISMATCH: &'static str = "rmap-mismatch";
    pub const REFCOUNT_MISMATCH: &'static str = "refcount-mismatch";
    pub const ORPHANED: &'static str = "orphaned";
    pub const QUOTA_MISMATCH: &'static str = "quota-mismatch";
    pub const NEEDSREPAIR_SET: &'static str = "needsrepair-set";
    pub const NEEDSREPAIR_CLEARED: &'static str = "needsrepair-cleared";
}

/// A monotonically increasing generator for synthetic/test inumbers and
/// similar run-scoped counters; not used on the repair hot path itself.
#[derive(Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

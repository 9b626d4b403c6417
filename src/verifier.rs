//! Whole-tree structural audit, independent of the filesystem: prunes directory rows that are
//! their own parent, whose parent chain is broken or cyclic, and file rows whose parent is gone.
//!
//! Unlike [`crate::reconciler::Reconciler`], this never touches disk — it only reasons about
//! what is already in the store, which is why it is offered as its own `--verify` mode rather
//! than folded into a crawl.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::FscrawlError;
use crate::store::Store;

/// Safety bound on how far an ancestor trace climbs before giving up and treating the chain as
/// broken. The historical tool traced unconditionally; a store corrupted by something other than
/// a simple self-loop or short cycle could otherwise spin the trace indefinitely.
pub const MAX_PARENT_CHAIN_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyStats {
    pub directories: u64,
    pub files: u64,
    pub directories_pruned: u64,
    pub files_pruned: u64,
}

enum TraceOutcome {
    Valid,
    Cycle,
    DepthExceeded(u32),
    Missing(u32),
}

pub struct Verifier<'a> {
    store: &'a Store,
    run: &'a AtomicBool,
}

impl<'a> Verifier<'a> {
    pub fn new(store: &'a Store, run: &'a AtomicBool) -> Self {
        Verifier { store, run }
    }

    fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub fn verify(&self) -> Result<VerifyStats, FscrawlError> {
        let mut stats = VerifyStats::default();
        let mut valid: HashSet<u32> = HashSet::new();

        for (id, parent) in self.store.query_all_dirs()? {
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
            stats.directories += 1;

            if id == parent {
                tracing::warn!(id, "directory is its own parent, pruning");
                self.store.delete_dir(id)?;
                stats.directories_pruned += 1;
                continue;
            }
            if valid.contains(&id) {
                continue;
            }

            match self.trace(id, parent, &valid)? {
                (Some(chain), TraceOutcome::Valid) => valid.extend(chain),
                (_, TraceOutcome::Cycle) => {
                    tracing::warn!(id, "cycle detected in parent chain, pruning");
                    self.store.delete_dir(id)?;
                    stats.directories_pruned += 1;
                }
                (_, TraceOutcome::DepthExceeded(last)) => {
                    tracing::warn!(id, last, max_depth = MAX_PARENT_CHAIN_DEPTH, "parent chain exceeded max depth, pruning");
                    self.store.delete_dir(last)?;
                    stats.directories_pruned += 1;
                }
                (_, TraceOutcome::Missing(last)) => {
                    tracing::warn!(id, last, "parent chain references a missing directory, pruning");
                    self.store.delete_dir(last)?;
                    stats.directories_pruned += 1;
                }
            }
        }

        for (id, parent) in self.store.query_all_files()? {
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
            stats.files += 1;
            if parent != 0 && !valid.contains(&parent) {
                tracing::warn!(id, parent, "file's parent directory is gone, pruning");
                self.store.delete_file(id)?;
                stats.files_pruned += 1;
            }
        }

        Ok(stats)
    }

    /// Walks the parent chain upward from `(id, parent)` until it reaches the root, a
    /// known-valid ancestor, the starting `id` again, a missing row, or the depth bound.
    /// Returns the chain of directory ids visited along with the way the walk ended; the chain
    /// is only merged into the caller's `valid` set when the outcome is [`TraceOutcome::Valid`].
    fn trace(&self, id: u32, parent: u32, valid: &HashSet<u32>) -> Result<(Option<Vec<u32>>, TraceOutcome), FscrawlError> {
        let mut chain = vec![id];
        let mut seen: HashSet<u32> = HashSet::from([id]);
        let mut temp_id = id;
        let mut temp_parent = parent;

        loop {
            if temp_parent == 0 || valid.contains(&temp_parent) {
                return Ok((Some(chain), TraceOutcome::Valid));
            }
            if chain.len() >= MAX_PARENT_CHAIN_DEPTH {
                return Ok((None, TraceOutcome::DepthExceeded(temp_id)));
            }
            match self.store.get_dir_parent(temp_parent)? {
                Some(grandparent) => {
                    temp_id = temp_parent;
                    temp_parent = grandparent;
                    if temp_parent == id || !seen.insert(temp_id) {
                        return Ok((None, TraceOutcome::Cycle));
                    }
                    chain.push(temp_id);
                }
                None => return Ok((None, TraceOutcome::Missing(temp_id))),
            }
        }
    }
}

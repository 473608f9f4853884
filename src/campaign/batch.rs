//! Grouping of covered mutations into conflict-free batches.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use super::tree::{MutationId, MutationTree, TreeError};

/// Partitions candidate mutations into batches that can be enabled together.
#[derive(Debug, Clone, Copy)]
pub struct MutantBatcher<'a> {
    tree: &'a MutationTree,
    batch_size: NonZeroUsize,
}

impl<'a> MutantBatcher<'a> {
    /// Batcher producing batches of at most `batch_size` mutations.
    pub fn new(tree: &'a MutationTree, batch_size: NonZeroUsize) -> Self {
        Self { tree, batch_size }
    }

    /// Maximum batch size.
    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Split `candidates` into batches.
    ///
    /// Candidates are drawn from the back of the queue. A candidate that
    /// conflicts with the batch under construction waits in a side queue and
    /// is put back before the next batch starts. Every candidate lands in
    /// exactly one batch and no batch holds two conflicting mutations.
    pub fn batches(&self, candidates: &[MutationId]) -> Result<Vec<Vec<MutationId>>, TreeError> {
        let mut queue: Vec<MutationId> = Vec::with_capacity(candidates.len());
        let mut seen = BTreeSet::new();
        for &candidate in candidates {
            if seen.insert(candidate) {
                queue.push(candidate);
            }
        }

        let mut batches = Vec::new();
        while !queue.is_empty() {
            let mut batch = Vec::new();
            let mut excluded = BTreeSet::new();
            let mut deferred = Vec::new();
            while batch.len() < self.batch_size.get() {
                let Some(candidate) = queue.pop() else {
                    break;
                };
                if excluded.contains(&candidate) {
                    deferred.push(candidate);
                    continue;
                }
                excluded.extend(self.tree.incompatible_with(candidate)?);
                batch.push(candidate);
            }
            while let Some(candidate) = deferred.pop() {
                queue.push(candidate);
            }
            batches.push(batch);
        }
        Ok(batches)
    }
}

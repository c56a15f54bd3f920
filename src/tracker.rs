/// Status-Change Tracker
///
/// Every mutating operation logs its transfer changes here instead of
/// touching the in-memory indexes directly. The tracker is folded into the
/// indexes only after the KV commit succeeds; a failed commit drops the
/// tracker and leaves the indexes exactly as they were. This is what keeps
/// a rollback from ever being observable through a reverse lookup.

use bitcoin::{BlockHash, Txid};

use crate::index::TransferIndexes;
use crate::transfer::{CrossChainTransfer, TransferStatus};

#[derive(Debug, Clone)]
pub struct TrackedChange {
    pub deposit_id: Txid,
    /// None when the transfer was created by this operation.
    pub old_status: Option<TransferStatus>,
    pub old_block: Option<(BlockHash, i32)>,
    /// None when the transfer was deleted by this operation.
    pub new_status: Option<TransferStatus>,
    pub new_block: Option<(BlockHash, i32)>,
}

#[derive(Debug, Default)]
pub struct StatusChangeTracker {
    changes: Vec<TrackedChange>,
}

impl StatusChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a create or update. `old` is the record as it stood before the
    /// operation, if it existed.
    pub fn record(&mut self, old: Option<&CrossChainTransfer>, new: &CrossChainTransfer) {
        self.changes.push(TrackedChange {
            deposit_id: new.deposit_id,
            old_status: old.map(|t| t.status),
            old_block: old.and_then(block_of),
            new_status: Some(new.status),
            new_block: block_of(new),
        });
    }

    pub fn record_deletion(&mut self, old: &CrossChainTransfer) {
        self.changes.push(TrackedChange {
            deposit_id: old.deposit_id,
            old_status: Some(old.status),
            old_block: block_of(old),
            new_status: None,
            new_block: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> &[TrackedChange] {
        &self.changes
    }

    /// Fold the log into the indexes. Called exactly once, after commit.
    pub fn apply(self, indexes: &mut TransferIndexes) {
        for change in self.changes {
            if let Some(old_status) = change.old_status {
                indexes.remove_status(old_status, &change.deposit_id);
            }
            if let Some((hash, _)) = change.old_block {
                indexes.remove_block_ref(&hash, &change.deposit_id);
            }
            if let Some(new_status) = change.new_status {
                indexes
                    .deposits_by_status
                    .entry(new_status)
                    .or_default()
                    .insert(change.deposit_id);
            }
            if let Some((hash, height)) = change.new_block {
                indexes
                    .deposit_ids_by_block_hash
                    .entry(hash)
                    .or_default()
                    .insert(change.deposit_id);
                indexes.block_heights_by_block_hash.insert(hash, height);
            }
        }
    }
}

fn block_of(transfer: &CrossChainTransfer) -> Option<(BlockHash, i32)> {
    match (transfer.block_hash, transfer.block_height) {
        (Some(hash), Some(height)) => Some((hash, height)),
        _ => None,
    }
}

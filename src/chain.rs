/// Local-Chain Interfaces
///
/// The store never talks to a node directly; it consumes the chain through
/// these two seams. `ChainIndex` answers header questions about the active
/// branch, `BlockRepository` performs batch block fetches. Both may block
/// on I/O and are invoked from `spawn_blocking` where that matters.

use bitcoin::{Block, BlockHash};

/// A (hash, height) pair identifying a block on this chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: i32,
}

/// Header view of an indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainIndexEntry {
    pub hash: BlockHash,
    pub height: i32,
    pub prev_hash: BlockHash,
}

pub trait ChainIndex: Send + Sync {
    /// Look up a block by hash, on any known branch.
    fn get_entry(&self, hash: &BlockHash) -> Option<ChainIndexEntry>;

    /// The active-branch block at the given height.
    fn entry_at_height(&self, height: i32) -> Option<ChainIndexEntry>;

    /// Highest active-branch block matching the locator, best match first.
    /// None when the locator has no intersection with this index.
    fn find_fork(&self, locator: &[BlockHash]) -> Option<ChainIndexEntry>;

    /// Active-branch tip.
    fn tip(&self) -> ChainTip;
}

pub trait BlockRepository: Send + Sync {
    /// Batch fetch; position i holds the block for hashes[i] or None when
    /// the repository does not have it.
    fn get_blocks(&self, hashes: &[BlockHash]) -> Vec<Option<Block>>;
}

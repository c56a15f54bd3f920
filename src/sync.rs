/// Synchronizer - chases the wallet tip on the local chain
///
/// Brings the store's recorded tip up to the wallet's tip-to-chase in
/// bounded batches, detecting and executing reorganizations between
/// batches. Two rewind situations exist:
/// 1. The wallet is ahead on a branch the chain index no longer carries:
///    the wallet itself rewinds via its block locator.
/// 2. Our recorded tip left the active branch (or overtook the wallet):
///    the store rewinds to the highest block it still shares with the
///    active branch, downgrading SeenInBlock transfers above the fork and
///    deleting seen-only transfers that have no deposit of record.

use bitcoin::BlockHash;
use tracing::{debug, info, warn};

use crate::chain::ChainTip;
use crate::kv::{KvTransaction, CF_COMMON, CF_TRANSFERS, REPOSITORY_TIP_KEY};
use crate::store::{encode_chain_tip, StoreInner};
use crate::tracker::StatusChangeTracker;
use crate::transfer::TransferStatus;

impl StoreInner {
    /// Bring our tip to the wallet's tip. Returns true once they match;
    /// false when cancelled or when the external state made no progress
    /// possible this round.
    pub(crate) async fn synchronize(
        &mut self,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            if self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(false);
            }

            let wallet_tip = self.wallet.tip_to_chase();
            if self.tip.map(|t| t.hash) == Some(wallet_tip.hash) {
                return Ok(true);
            }

            if self.rewind_if_required().await? {
                continue;
            }

            let before = self.tip.map(|t| t.height).unwrap_or(-1);
            if self.synchronize_batch().await? {
                return Ok(true);
            }
            if self.tip.map(|t| t.height).unwrap_or(-1) == before {
                // No forward progress; leave it for the next operation.
                debug!("Synchronizer made no progress, deferring");
                return Ok(false);
            }
        }
    }

    /// Detect and execute a rewind. Returns true when anything changed,
    /// so the caller re-reads the wallet tip before continuing.
    pub(crate) async fn rewind_if_required(
        &mut self,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let wallet_tip = self.wallet.tip_to_chase();

        if self.tip.map(|t| t.hash) == Some(wallet_tip.hash) {
            return Ok(false);
        }

        // The chain index does not know the wallet's tip: the wallet sits
        // on a stale branch and must rewind itself first.
        if self.chain.get_entry(&wallet_tip.hash).is_none() {
            let locator = self.wallet.block_locator();
            // An empty intersection rewinds the wallet to genesis.
            let fork_height = self
                .chain
                .find_fork(&locator)
                .map(|entry| entry.height)
                .unwrap_or(0);
            warn!(
                wallet_tip = %wallet_tip.hash,
                fork_height,
                "Wallet tip unknown to the chain index, rewinding wallet"
            );
            self.wallet.remove_blocks(fork_height)?;
            self.wallet.save_wallet()?;
            return Ok(true);
        }

        let needs_rewind = match &self.tip {
            None => false,
            Some(tip) => {
                tip.height > wallet_tip.height
                    || self.chain.entry_at_height(tip.height).map(|e| e.hash) != Some(tip.hash)
            }
        };
        if !needs_rewind {
            return Ok(false);
        }

        // Fork: the highest block we have transfers recorded against that
        // is still on the active branch at or below the wallet height.
        let fork = self
            .indexes
            .block_heights_by_block_hash
            .iter()
            .filter(|(_, &height)| height <= wallet_tip.height)
            .filter(|(hash, &height)| {
                self.chain
                    .entry_at_height(height)
                    .map(|entry| entry.hash == **hash)
                    .unwrap_or(false)
            })
            .max_by_key(|(_, &height)| height)
            .map(|(hash, &height)| ChainTip { hash: *hash, height });

        self.rewind_to(fork).await?;
        self.validate_transfers(None).await?;
        Ok(true)
    }

    /// Undo everything recorded above the fork. SeenInBlock transfers
    /// with a deposit of record fall back to FullySigned; seen-only
    /// transfers are removed entirely.
    pub(crate) async fn rewind_to(
        &mut self,
        new_tip: Option<ChainTip>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fork_height = new_tip.map(|t| t.height).unwrap_or(-1);

        let mut txn = KvTransaction::new(self.db.clone());
        let mut tracker = StatusChangeTracker::new();
        let mut downgraded = 0usize;
        let mut deleted = 0usize;

        for deposit_id in self.indexes.deposits_with_status(TransferStatus::SeenInBlock) {
            let transfer = match self.get_transfer_row(&deposit_id)? {
                Some(transfer) => transfer,
                None => continue,
            };
            let height = match transfer.block_height {
                Some(height) => height,
                None => continue,
            };
            if height <= fork_height {
                continue;
            }

            if transfer.deposit_height.is_some() {
                let mut unseen = transfer.clone();
                unseen.status = TransferStatus::FullySigned;
                unseen.block_hash = None;
                unseen.block_height = None;
                txn.put(CF_TRANSFERS, unseen.key().to_vec(), unseen.encode());
                tracker.record(Some(&transfer), &unseen);
                downgraded += 1;
            } else {
                txn.delete(CF_TRANSFERS, transfer.key().to_vec());
                tracker.record_deletion(&transfer);
                deleted += 1;
            }
        }

        match &new_tip {
            Some(tip) => txn.put(CF_COMMON, REPOSITORY_TIP_KEY.to_vec(), encode_chain_tip(tip)),
            None => txn.delete(CF_COMMON, REPOSITORY_TIP_KEY.to_vec()),
        }

        txn.commit().await?;
        tracker.apply(&mut self.indexes);
        self.tip = new_tip;

        warn!(fork_height, downgraded, deleted, "Rewound transfer store");
        Ok(())
    }

    /// Consume up to one batch of active-branch blocks. Returns true once
    /// we have caught up with the wallet tip.
    pub(crate) async fn synchronize_batch(
        &mut self,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let wallet_tip = self.wallet.tip_to_chase();
        let our_height = self.tip.map(|t| t.height).unwrap_or(-1);
        if our_height >= wallet_tip.height {
            return Ok(true);
        }

        let batch_end = wallet_tip
            .height
            .min(our_height + self.settings.sync_batch_size as i32);
        let mut hashes: Vec<BlockHash> = Vec::new();
        for height in (our_height + 1)..=batch_end {
            match self.chain.entry_at_height(height) {
                Some(entry) => hashes.push(entry.hash),
                None => break,
            }
        }
        if hashes.is_empty() {
            return Ok(false);
        }

        let repository = self.blocks.clone();
        let wanted = hashes.clone();
        let fetched = tokio::task::spawn_blocking(move || repository.get_blocks(&wanted))
            .await
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;

        // A missing block terminates the batch.
        let mut to_apply = Vec::new();
        for (offset, block) in fetched.into_iter().enumerate() {
            match block {
                Some(block) => to_apply.push((our_height + 1 + offset as i32, block)),
                None => break,
            }
        }
        if to_apply.is_empty() {
            return Ok(false);
        }

        let first = to_apply.first().map(|(h, _)| *h).unwrap_or(0);
        let last = to_apply.last().map(|(h, _)| *h).unwrap_or(0);
        info!(from = first, to = last, "Consuming local blocks");
        self.put_blocks(to_apply).await?;

        Ok(self.tip.map(|t| t.hash) == Some(wallet_tip.hash)
            || self.tip.map(|t| t.height).unwrap_or(-1) >= wallet_tip.height)
    }
}

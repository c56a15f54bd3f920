/// Cross-Chain Transfer Store
///
/// The stateful engine of the federated two-way peg. Consumes mature
/// counter-chain deposits and local-chain blocks, builds and co-signs
/// deterministic withdrawal transactions, and tracks each transfer through
/// Suspended -> Partial -> FullySigned -> SeenInBlock (with backwards
/// transitions on reorg).
///
/// Concurrency model: one `StoreInner` owned by a tokio Mutex. Every
/// exposed operation locks it for its full duration, so at most one
/// mutation is in flight and the wallet is never raced. All mutations are
/// staged in a KvTransaction plus a StatusChangeTracker; the in-memory
/// indexes only change after the KV commit succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use rocksdb::DB;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::builder::{build_deterministic_transaction, canonical_outpoint_key};
use crate::chain::{BlockRepository, ChainIndex, ChainTip};
use crate::config::FederatedPegSettings;
use crate::extractor::{Deposit, WithdrawalExtractor};
use crate::index::TransferIndexes;
use crate::kv::{
    kv_get, open_store_db, KvTransaction, CF_COMMON, CF_TRANSFERS, NEXT_MATURE_TIP_KEY,
    REPOSITORY_TIP_KEY,
};
use crate::tracker::StatusChangeTracker;
use crate::transfer::{CrossChainTransfer, TransferStatus};
use crate::verify::validate_fully_signed;
use crate::wallet::FederationWallet;

pub(crate) fn encode_chain_tip(tip: &ChainTip) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    out.extend_from_slice(&tip.hash.into_inner());
    out.extend_from_slice(&tip.height.to_be_bytes());
    out
}

pub(crate) fn decode_chain_tip(
    bytes: &[u8],
) -> Result<ChainTip, Box<dyn std::error::Error + Send + Sync>> {
    if bytes.len() != 36 {
        return Err(format!("Bad tip value length: {}", bytes.len()).into());
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[..32]);
    let height = i32::from_be_bytes(bytes[32..36].try_into()?);
    Ok(ChainTip {
        hash: BlockHash::from_inner(hash),
        height,
    })
}

pub(crate) struct StoreInner {
    pub(crate) db: Arc<DB>,
    pub(crate) settings: FederatedPegSettings,
    pub(crate) wallet: Arc<dyn FederationWallet>,
    pub(crate) chain: Arc<dyn ChainIndex>,
    pub(crate) blocks: Arc<dyn BlockRepository>,
    pub(crate) withdrawal_extractor: Arc<dyn WithdrawalExtractor>,
    pub(crate) indexes: TransferIndexes,
    /// Highest local block whose withdrawals have been recorded.
    pub(crate) tip: Option<ChainTip>,
    /// Next expected mature counter-chain height.
    pub(crate) next_mature_deposit_height: i32,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl StoreInner {
    pub(crate) fn get_transfer_row(
        &self,
        deposit_id: &Txid,
    ) -> Result<Option<CrossChainTransfer>, Box<dyn std::error::Error + Send + Sync>> {
        match kv_get(&self.db, CF_TRANSFERS, &deposit_id.into_inner())? {
            Some(bytes) => Ok(Some(CrossChainTransfer::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_transfer_rows(
        &self,
        deposit_ids: &[Txid],
    ) -> Result<Vec<Option<CrossChainTransfer>>, Box<dyn std::error::Error + Send + Sync>> {
        deposit_ids.iter().map(|id| self.get_transfer_row(id)).collect()
    }

    fn stage(
        txn: &mut KvTransaction,
        tracker: &mut StatusChangeTracker,
        old: Option<&CrossChainTransfer>,
        new: &CrossChainTransfer,
    ) {
        txn.put(CF_TRANSFERS, new.key().to_vec(), new.encode());
        tracker.record(old, new);
    }

    /// Sanity validation: a Partial or FullySigned transfer must have all
    /// of its inputs reserved in the wallet for exactly its transaction.
    /// Offenders are suspended, the mature cursor moves back so the
    /// deposit is retried, and the stale transaction leaves the wallet
    /// after commit. This is the only path that decreases the cursor.
    pub(crate) async fn validate_transfers(
        &mut self,
        scope: Option<Vec<Txid>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ids = match scope {
            Some(ids) => ids,
            None => {
                let mut ids = self.indexes.deposits_with_status(TransferStatus::Partial);
                ids.extend(self.indexes.deposits_with_status(TransferStatus::FullySigned));
                ids
            }
        };
        if ids.is_empty() {
            return Ok(());
        }

        let reservations: HashMap<OutPoint, Txid> = self
            .wallet
            .multisig_coins()
            .into_iter()
            .filter_map(|coin| {
                coin.spending_details
                    .map(|details| (coin.outpoint, details.transaction_id))
            })
            .collect();

        let mut txn = KvTransaction::new(self.db.clone());
        let mut tracker = StatusChangeTracker::new();
        let mut offenders: Vec<Transaction> = Vec::new();
        let prev_cursor = self.next_mature_deposit_height;
        let mut cursor = self.next_mature_deposit_height;

        for id in ids {
            let transfer = match self.get_transfer_row(&id)? {
                Some(transfer) => transfer,
                None => continue,
            };
            if !matches!(
                transfer.status,
                TransferStatus::Partial | TransferStatus::FullySigned
            ) {
                continue;
            }
            let tx = match &transfer.partial_transaction {
                Some(tx) => tx.clone(),
                None => continue,
            };
            let txid = tx.txid();

            let intact = tx.input.iter().all(|input| {
                reservations.get(&input.previous_output) == Some(&txid)
            });
            if intact {
                continue;
            }

            warn!(
                deposit_id = %transfer.deposit_id,
                status = %transfer.status,
                "Withdrawal inputs no longer reserved, suspending transfer"
            );

            let mut suspended = transfer.clone();
            suspended.status = TransferStatus::Suspended;
            suspended.partial_transaction = None;
            Self::stage(&mut txn, &mut tracker, Some(&transfer), &suspended);

            if let Some(deposit_height) = transfer.deposit_height {
                cursor = cursor.min(deposit_height);
            }
            offenders.push(tx);
        }

        if tracker.is_empty() {
            return Ok(());
        }
        if cursor != prev_cursor {
            txn.put(CF_COMMON, NEXT_MATURE_TIP_KEY.to_vec(), cursor.to_be_bytes().to_vec());
        }

        match txn.commit().await {
            Ok(()) => {
                tracker.apply(&mut self.indexes);
                self.next_mature_deposit_height = cursor;
                for tx in &offenders {
                    self.wallet.remove_transaction(tx);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deposit ingestion: create or retry transfers for one mature
    /// counter-chain height, strictly in order.
    pub(crate) async fn record_latest_mature_deposits(
        &mut self,
        deposits: &[Deposit],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if deposits.is_empty() {
            self.next_mature_deposit_height += 1;
            debug!(
                next_height = self.next_mature_deposit_height,
                "Empty mature batch, cursor advanced"
            );
            return Ok(());
        }

        let batch_height = self.next_mature_deposit_height;
        for deposit in deposits {
            if deposit.block_number != batch_height {
                return Err(format!(
                    "Deposit {} is for height {}, expected {}",
                    deposit.id, deposit.block_number, batch_height
                )
                .into());
            }
        }

        self.synchronize().await?;
        self.validate_transfers(None).await?;

        let prev_cursor = self.next_mature_deposit_height;
        let mut txn = KvTransaction::new(self.db.clone());
        let mut tracker = StatusChangeTracker::new();
        let mut reserved: Vec<Transaction> = Vec::new();
        let mut have_suspended = false;

        let mut outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = Ok(());

        for deposit in deposits {
            let existing = match self.get_transfer_row(&deposit.id) {
                Ok(existing) => existing,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            if let Some(transfer) = &existing {
                if transfer.status != TransferStatus::Suspended {
                    debug!(deposit_id = %deposit.id, status = %transfer.status, "Deposit already handled");
                    continue;
                }
            }

            let base = CrossChainTransfer {
                deposit_id: deposit.id,
                deposit_height: Some(deposit.block_number),
                target_script: deposit.target_script.clone(),
                amount: deposit.amount,
                partial_transaction: None,
                block_hash: None,
                block_height: None,
                status: TransferStatus::Suspended,
            };

            // A deposit that cannot even cover the flat fee is permanently
            // rejected and never blocks the batch.
            if deposit.amount <= self.settings.transaction_fee {
                let mut rejected = base;
                rejected.status = TransferStatus::Rejected;
                warn!(deposit_id = %deposit.id, amount = deposit.amount, "Deposit below withdrawal fee, rejecting");
                Self::stage(&mut txn, &mut tracker, existing.as_ref(), &rejected);
                continue;
            }

            // Strict in-order processing: once one deposit fails to fund,
            // everything after it in the batch stays suspended.
            if have_suspended {
                Self::stage(&mut txn, &mut tracker, existing.as_ref(), &base);
                continue;
            }

            let built = build_deterministic_transaction(
                &self.settings,
                self.wallet.as_ref(),
                deposit.id,
                &deposit.target_script,
                deposit.amount,
            );

            match built {
                Some(tx) if self.wallet.process_transaction(&tx) => {
                    info!(
                        deposit_id = %deposit.id,
                        withdrawal_id = %tx.txid(),
                        amount = deposit.amount,
                        "Built deterministic withdrawal"
                    );
                    reserved.push(tx.clone());
                    let mut partial = base;
                    partial.status = TransferStatus::Partial;
                    partial.partial_transaction = Some(tx);
                    Self::stage(&mut txn, &mut tracker, existing.as_ref(), &partial);
                }
                _ => {
                    info!(deposit_id = %deposit.id, "Cannot fund withdrawal, suspending");
                    have_suspended = true;
                    Self::stage(&mut txn, &mut tracker, existing.as_ref(), &base);
                }
            }
        }

        if outcome.is_ok() {
            // Sanity validation may have moved the cursor below this
            // batch's height; advancing then would skip the retry it set up.
            if !have_suspended && self.next_mature_deposit_height == batch_height {
                self.next_mature_deposit_height += 1;
                txn.put(
                    CF_COMMON,
                    NEXT_MATURE_TIP_KEY.to_vec(),
                    self.next_mature_deposit_height.to_be_bytes().to_vec(),
                );
            }
            outcome = txn.commit().await;
        } else {
            txn.rollback();
        }

        match outcome {
            Ok(()) => {
                tracker.apply(&mut self.indexes);
                Ok(())
            }
            Err(e) => {
                // Undo this batch's wallet reservations and the cursor move.
                for tx in &reserved {
                    self.wallet.remove_transaction(tx);
                }
                self.next_mature_deposit_height = prev_cursor;
                Err(e)
            }
        }
    }

    /// Signature merge: fold peer partials into our draft, promote to
    /// FullySigned once the set verifies. Protocol-invalid calls are
    /// no-ops, never errors.
    pub(crate) async fn merge_transaction_signatures(
        &mut self,
        deposit_id: Txid,
        partials: &[Transaction],
    ) -> Result<Option<Transaction>, Box<dyn std::error::Error + Send + Sync>> {
        self.synchronize().await?;

        if self.get_transfer_row(&deposit_id)?.is_none() {
            debug!(deposit_id = %deposit_id, "Merge for unknown deposit ignored");
            return Ok(None);
        }
        self.validate_transfers(Some(vec![deposit_id])).await?;

        let transfer = match self.get_transfer_row(&deposit_id)? {
            Some(transfer) => transfer,
            None => return Ok(None),
        };
        if transfer.status != TransferStatus::Partial {
            debug!(
                deposit_id = %deposit_id,
                status = %transfer.status,
                "Merge ignored, transfer is not Partial"
            );
            return Ok(transfer.partial_transaction);
        }

        let old_tx = match &transfer.partial_transaction {
            Some(tx) => tx.clone(),
            None => return Err(format!("Partial transfer {} has no transaction", deposit_id).into()),
        };
        let old_id = old_tx.txid();

        let merged = self.wallet.combine_signatures(&old_tx, partials);
        if merged.txid() == old_id {
            debug!(deposit_id = %deposit_id, "Merge produced no new signatures");
            return Ok(Some(old_tx));
        }

        // The hash changed: re-point the wallet reservation first so the
        // validity check sees the new transaction as the reserver.
        self.wallet.update_spending_transaction(old_id, &merged);

        let mut updated = transfer.clone();
        updated.partial_transaction = Some(merged.clone());
        let coins = self.wallet.multisig_coins();
        if validate_fully_signed(&self.settings, &coins, &merged) {
            updated.status = TransferStatus::FullySigned;
        }

        let mut txn = KvTransaction::new(self.db.clone());
        let mut tracker = StatusChangeTracker::new();
        Self::stage(&mut txn, &mut tracker, Some(&transfer), &updated);

        match txn.commit().await {
            Ok(()) => {
                tracker.apply(&mut self.indexes);
                info!(
                    deposit_id = %deposit_id,
                    old_id = %old_id,
                    new_id = %merged.txid(),
                    status = %updated.status,
                    "Merged peer signatures"
                );
                Ok(Some(merged))
            }
            Err(e) => {
                // Restore the previous draft in the wallet's view.
                self.wallet.update_spending_transaction(merged.txid(), &old_tx);
                Err(e)
            }
        }
    }

    /// Local-chain observation: record withdrawals found in our blocks
    /// and advance the repository tip, one committed transaction per block.
    pub(crate) async fn put_blocks(
        &mut self,
        blocks: Vec<(i32, bitcoin::Block)>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for (height, block) in blocks {
            let hash = block.block_hash();
            let withdrawals = self.withdrawal_extractor.extract_from_block(&block, height);

            let mut txn = KvTransaction::new(self.db.clone());
            let mut tracker = StatusChangeTracker::new();

            for withdrawal in &withdrawals {
                let existing = self.get_transfer_row(&withdrawal.deposit_id)?;
                let updated = match &existing {
                    Some(transfer) => {
                        let mut seen = transfer.clone();
                        seen.status = TransferStatus::SeenInBlock;
                        seen.partial_transaction = Some(withdrawal.transaction.clone());
                        seen.block_hash = Some(hash);
                        seen.block_height = Some(height);
                        seen
                    }
                    // First sighting without any deposit record of our own.
                    None => CrossChainTransfer {
                        deposit_id: withdrawal.deposit_id,
                        deposit_height: None,
                        target_script: withdrawal.target_script.clone(),
                        amount: withdrawal.amount,
                        partial_transaction: Some(withdrawal.transaction.clone()),
                        block_hash: Some(hash),
                        block_height: Some(height),
                        status: TransferStatus::SeenInBlock,
                    },
                };
                Self::stage(&mut txn, &mut tracker, existing.as_ref(), &updated);
            }

            let tip = ChainTip { hash, height };
            txn.put(CF_COMMON, REPOSITORY_TIP_KEY.to_vec(), encode_chain_tip(&tip));
            txn.commit().await?;
            tracker.apply(&mut self.indexes);
            self.tip = Some(tip);

            if !withdrawals.is_empty() {
                info!(height, count = withdrawals.len(), "Recorded withdrawals from block");
            }
        }
        Ok(())
    }

    pub(crate) async fn save_current_tip(
        &self,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut txn = KvTransaction::new(self.db.clone());
        txn.put(
            CF_COMMON,
            NEXT_MATURE_TIP_KEY.to_vec(),
            self.next_mature_deposit_height.to_be_bytes().to_vec(),
        );
        if let Some(tip) = &self.tip {
            txn.put(CF_COMMON, REPOSITORY_TIP_KEY.to_vec(), encode_chain_tip(tip));
        }
        txn.commit().await
    }

    fn assert_startup_invariants(&self) {
        for status in TransferStatus::all() {
            for id in self.indexes.deposits_with_status(status) {
                let transfer = self
                    .get_transfer_row(&id)
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| panic!("Indexed transfer {} missing from table", id));
                assert_eq!(
                    transfer.status, status,
                    "Transfer {} indexed under wrong status",
                    transfer.deposit_id
                );
                assert_eq!(
                    transfer.status == TransferStatus::SeenInBlock,
                    transfer.block_hash.is_some(),
                    "Transfer {} block presence disagrees with status",
                    transfer.deposit_id
                );
                if matches!(
                    transfer.status,
                    TransferStatus::Partial | TransferStatus::FullySigned | TransferStatus::SeenInBlock
                ) {
                    assert!(
                        transfer.partial_transaction.is_some(),
                        "Transfer {} in {} has no transaction",
                        transfer.deposit_id,
                        transfer.status
                    );
                }
            }
        }
    }
}

/// Public handle. All operations are async and serialized by one lock.
pub struct CrossChainTransferStore {
    inner: Arc<Mutex<StoreInner>>,
    shutdown: Arc<AtomicBool>,
}

impl CrossChainTransferStore {
    pub fn new(
        settings: FederatedPegSettings,
        wallet: Arc<dyn FederationWallet>,
        chain: Arc<dyn ChainIndex>,
        blocks: Arc<dyn BlockRepository>,
        withdrawal_extractor: Arc<dyn WithdrawalExtractor>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let db = open_store_db(&settings.data_dir())?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let start_height = settings.counter_chain_start_height;
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                db,
                settings,
                wallet,
                chain,
                blocks,
                withdrawal_extractor,
                indexes: TransferIndexes::default(),
                tip: None,
                next_mature_deposit_height: start_height,
                shutdown: shutdown.clone(),
            })),
            shutdown,
        })
    }

    /// Rebuild in-memory state from the KV alone and assert invariants.
    pub async fn initialize(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self.inner.lock().await;

        let rebuilt = TransferIndexes::rebuild(&inner.db)?;
        inner.indexes = rebuilt;

        let tip = match kv_get(&inner.db, CF_COMMON, &REPOSITORY_TIP_KEY)? {
            Some(bytes) => Some(decode_chain_tip(&bytes)?),
            None => None,
        };
        inner.tip = tip;
        if let Some(bytes) = kv_get(&inner.db, CF_COMMON, &NEXT_MATURE_TIP_KEY)? {
            let stored = i32::from_be_bytes(bytes.as_slice().try_into()?);
            let cursor = stored.max(inner.settings.counter_chain_start_height);
            inner.next_mature_deposit_height = cursor;
        }

        inner.assert_startup_invariants();

        info!(
            tip_height = inner.tip.as_ref().map(|t| t.height).unwrap_or(-1),
            next_mature_height = inner.next_mature_deposit_height,
            "Transfer store initialized"
        );
        Ok(())
    }

    /// Align with the wallet tip once and persist the cursor.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self.inner.lock().await;
        inner.synchronize().await?;
        inner.save_current_tip().await
    }

    /// Signal shutdown and flush both common keys. Idempotent.
    pub async fn dispose(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.shutdown.store(true, Ordering::SeqCst);
        let inner = self.inner.lock().await;
        inner.save_current_tip().await?;
        info!("Transfer store disposed");
        Ok(())
    }

    /// Fetch transfers in input order; None where missing.
    pub async fn get(
        &self,
        deposit_ids: &[Txid],
    ) -> Result<Vec<Option<CrossChainTransfer>>, Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self.inner.lock().await;
        inner.synchronize().await?;
        inner.get_transfer_rows(deposit_ids)
    }

    pub async fn record_latest_mature_deposits(
        &self,
        deposits: &[Deposit],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self.inner.lock().await;
        inner.record_latest_mature_deposits(deposits).await
    }

    pub async fn merge_transaction_signatures(
        &self,
        deposit_id: Txid,
        partials: &[Transaction],
    ) -> Result<Option<Transaction>, Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self.inner.lock().await;
        inner.merge_transaction_signatures(deposit_id, partials).await
    }

    /// Transactions in the given status, sorted by the canonical ordering
    /// key of each transaction's first input.
    pub async fn get_transactions_by_status(
        &self,
        status: TransferStatus,
    ) -> Result<Vec<(Txid, Transaction)>, Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self.inner.lock().await;
        inner.synchronize().await?;

        let mut entries = Vec::new();
        for id in inner.indexes.deposits_with_status(status) {
            if let Some(transfer) = inner.get_transfer_row(&id)? {
                if let Some(tx) = transfer.partial_transaction {
                    entries.push((id, tx));
                }
            }
        }
        entries.sort_by_key(|(_, tx)| {
            tx.input
                .first()
                .map(|input| canonical_outpoint_key(&input.previous_output))
                .unwrap_or(([0xFF; 32], u32::MAX))
        });
        Ok(entries)
    }

    pub async fn save_current_tip(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let inner = self.inner.lock().await;
        inner.save_current_tip().await
    }

    pub async fn has_suspended(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.indexes.has_status(TransferStatus::Suspended)
    }

    pub async fn next_matured_block_height(&self) -> i32 {
        let inner = self.inner.lock().await;
        inner.next_mature_deposit_height
    }

    /// Highest local block consumed by the store.
    pub async fn current_tip(&self) -> Option<ChainTip> {
        let inner = self.inner.lock().await;
        inner.tip
    }

    #[cfg(test)]
    pub(crate) async fn indexes_snapshot(&self) -> TransferIndexes {
        let inner = self.inner.lock().await;
        inner.indexes.clone()
    }
}

/// In-Memory Transfer Indexes
///
/// Reverse lookups over the transfers table: by status, by observing
/// block hash, and block height by hash. Rebuilt from a full table scan on
/// startup; afterwards mutated only by folding a committed
/// StatusChangeTracker in, never inline from an operation.

use std::collections::{HashMap, HashSet};

use bitcoin::{BlockHash, Txid};
use rocksdb::DB;

use crate::kv::{kv_scan, CF_TRANSFERS};
use crate::transfer::{CrossChainTransfer, TransferStatus};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferIndexes {
    pub deposits_by_status: HashMap<TransferStatus, HashSet<Txid>>,
    pub deposit_ids_by_block_hash: HashMap<BlockHash, HashSet<Txid>>,
    pub block_heights_by_block_hash: HashMap<BlockHash, i32>,
}

impl TransferIndexes {
    /// Rebuild from a full scan of the transfers table.
    pub fn rebuild(db: &DB) -> Result<TransferIndexes, Box<dyn std::error::Error + Send + Sync>> {
        let mut indexes = TransferIndexes::default();
        for (key, value) in kv_scan(db, CF_TRANSFERS)? {
            let transfer = CrossChainTransfer::decode(&value).map_err(|e| {
                format!("Corrupt transfer row {}: {}", hex::encode(&key), e)
            })?;
            indexes.insert_record(&transfer);
        }
        Ok(indexes)
    }

    pub fn insert_record(&mut self, transfer: &CrossChainTransfer) {
        self.deposits_by_status
            .entry(transfer.status)
            .or_default()
            .insert(transfer.deposit_id);

        if let (Some(hash), Some(height)) = (transfer.block_hash, transfer.block_height) {
            self.deposit_ids_by_block_hash
                .entry(hash)
                .or_default()
                .insert(transfer.deposit_id);
            self.block_heights_by_block_hash.insert(hash, height);
        }
    }

    pub fn remove_status(&mut self, status: TransferStatus, deposit_id: &Txid) {
        if let Some(bucket) = self.deposits_by_status.get_mut(&status) {
            bucket.remove(deposit_id);
            if bucket.is_empty() {
                self.deposits_by_status.remove(&status);
            }
        }
    }

    /// Drop a block reference; the height entry goes with the last referrer.
    pub fn remove_block_ref(&mut self, hash: &BlockHash, deposit_id: &Txid) {
        if let Some(ids) = self.deposit_ids_by_block_hash.get_mut(hash) {
            ids.remove(deposit_id);
            if ids.is_empty() {
                self.deposit_ids_by_block_hash.remove(hash);
                self.block_heights_by_block_hash.remove(hash);
            }
        }
    }

    pub fn deposits_with_status(&self, status: TransferStatus) -> Vec<Txid> {
        self.deposits_by_status
            .get(&status)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_status(&self, status: TransferStatus) -> bool {
        self.deposits_by_status
            .get(&status)
            .map(|bucket| !bucket.is_empty())
            .unwrap_or(false)
    }

    pub fn status_of(&self, deposit_id: &Txid) -> Option<TransferStatus> {
        self.deposits_by_status
            .iter()
            .find(|(_, bucket)| bucket.contains(deposit_id))
            .map(|(status, _)| *status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{open_store_db, KvTransaction};
    use bitcoin::blockdata::script::Builder;
    use bitcoin::hashes::Hash;
    use tempfile::TempDir;

    fn transfer(id: u8, status: TransferStatus, block: Option<(u8, i32)>) -> CrossChainTransfer {
        CrossChainTransfer {
            deposit_id: Txid::from_inner([id; 32]),
            deposit_height: Some(5),
            target_script: Builder::new().push_int(1).into_script(),
            amount: 100,
            partial_transaction: None,
            block_hash: block.map(|(b, _)| BlockHash::from_inner([b; 32])),
            block_height: block.map(|(_, h)| h),
            status,
        }
    }

    #[tokio::test]
    async fn rebuild_matches_inserts() {
        let temp = TempDir::new().unwrap();
        let db = open_store_db(temp.path()).unwrap();

        let rows = vec![
            transfer(1, TransferStatus::Partial, None),
            transfer(2, TransferStatus::SeenInBlock, Some((9, 100))),
            transfer(3, TransferStatus::Suspended, None),
        ];

        let mut expected = TransferIndexes::default();
        let mut txn = KvTransaction::new(db.clone());
        for row in &rows {
            expected.insert_record(row);
            txn.put(CF_TRANSFERS, row.key().to_vec(), row.encode());
        }
        txn.commit().await.unwrap();

        let rebuilt = TransferIndexes::rebuild(&db).unwrap();
        assert_eq!(rebuilt, expected);
        assert_eq!(
            rebuilt.block_heights_by_block_hash[&BlockHash::from_inner([9u8; 32])],
            100
        );
    }

    #[test]
    fn block_height_entry_leaves_with_last_referrer() {
        let mut indexes = TransferIndexes::default();
        let a = transfer(1, TransferStatus::SeenInBlock, Some((9, 100)));
        let b = transfer(2, TransferStatus::SeenInBlock, Some((9, 100)));
        indexes.insert_record(&a);
        indexes.insert_record(&b);

        let hash = BlockHash::from_inner([9u8; 32]);
        indexes.remove_block_ref(&hash, &a.deposit_id);
        assert!(indexes.block_heights_by_block_hash.contains_key(&hash));

        indexes.remove_block_ref(&hash, &b.deposit_id);
        assert!(!indexes.block_heights_by_block_hash.contains_key(&hash));
        assert!(!indexes.deposit_ids_by_block_hash.contains_key(&hash));
    }
}

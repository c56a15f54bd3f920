/// Durable KV Layer
///
/// Two logical tables backed by RocksDB column families:
/// - `transfers`: 32-byte deposit id -> encoded CrossChainTransfer
/// - `common`: single-byte keys for the repository tip and the
///   next-mature-deposit cursor
///
/// Mutations are staged in a `KvTransaction` and committed through a single
/// RocksDB WriteBatch, so a crash mid-operation leaves either all writes or
/// none. Staged writes are visible to `get` on the same transaction
/// (read-your-writes); rollback is simply dropping the transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{Options, WriteBatch, DB};

pub const CF_TRANSFERS: &str = "transfers";
pub const CF_COMMON: &str = "common";

/// `common` table key of the local-chain tip consumed by the store.
pub const REPOSITORY_TIP_KEY: [u8; 1] = [0x00];
/// `common` table key of the next expected mature counter-chain height.
pub const NEXT_MATURE_TIP_KEY: [u8; 1] = [0x01];

const COLUMN_FAMILIES: [&str; 2] = [CF_TRANSFERS, CF_COMMON];

/// Open (or create) the store database at the given directory.
pub fn open_store_db(path: &Path) -> Result<Arc<DB>, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(path)?;

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let db = DB::open_cf(&opts, path, COLUMN_FAMILIES)?;
    Ok(Arc::new(db))
}

pub fn kv_get(
    db: &DB,
    cf_name: &str,
    key: &[u8],
) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync>> {
    let cf = db
        .cf_handle(cf_name)
        .ok_or_else(|| format!("Column family not found: {}", cf_name))?;
    Ok(db.get_cf(&cf, key)?)
}

/// Full scan of one table. Used by index rebuilds and invariant checks.
pub fn kv_scan(
    db: &DB,
    cf_name: &str,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Box<dyn std::error::Error + Send + Sync>> {
    let cf = db
        .cf_handle(cf_name)
        .ok_or_else(|| format!("Column family not found: {}", cf_name))?;

    let mut rows = Vec::new();
    for item in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
        let (key, value) = item?;
        rows.push((key.to_vec(), value.to_vec()));
    }
    Ok(rows)
}

#[derive(Clone)]
enum Op {
    Put { cf_name: &'static str, key: Vec<u8>, value: Vec<u8> },
    Delete { cf_name: &'static str, key: Vec<u8> },
}

/// Staged multi-key transaction spanning both tables.
pub struct KvTransaction {
    db: Arc<DB>,
    ops: Vec<Op>,
}

impl KvTransaction {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db, ops: Vec::new() }
    }

    pub fn put(&mut self, cf_name: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Op::Put { cf_name, key, value });
    }

    pub fn delete(&mut self, cf_name: &'static str, key: Vec<u8>) {
        self.ops.push(Op::Delete { cf_name, key });
    }

    pub fn pending_count(&self) -> usize {
        self.ops.len()
    }

    /// Read through the staged ops first, then the database.
    pub fn get(
        &self,
        cf_name: &'static str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync>> {
        for op in self.ops.iter().rev() {
            match op {
                Op::Put { cf_name: cf, key: k, value } if *cf == cf_name && k == key => {
                    return Ok(Some(value.clone()));
                }
                Op::Delete { cf_name: cf, key: k } if *cf == cf_name && k == key => {
                    return Ok(None);
                }
                _ => {}
            }
        }
        kv_get(&self.db, cf_name, key)
    }

    /// Commit all staged operations in one atomic WriteBatch.
    ///
    /// Either every operation across both tables lands, or none do.
    pub async fn commit(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.ops.is_empty() {
            return Ok(());
        }

        let db = self.db;
        let ops = self.ops;

        tokio::task::spawn_blocking(move || {
            let mut batch = WriteBatch::default();

            // Group operations by CF for handle lookup
            let mut by_cf: HashMap<&'static str, Vec<&Op>> = HashMap::new();
            for op in &ops {
                let cf_name = match op {
                    Op::Put { cf_name, .. } => cf_name,
                    Op::Delete { cf_name, .. } => cf_name,
                };
                by_cf.entry(cf_name).or_default().push(op);
            }

            for (cf_name, cf_ops) in by_cf {
                let cf = db
                    .cf_handle(cf_name)
                    .ok_or_else(|| format!("Column family not found: {}", cf_name))?;
                for op in cf_ops {
                    match op {
                        Op::Put { key, value, .. } => batch.put_cf(&cf, key, value),
                        Op::Delete { key, .. } => batch.delete_cf(&cf, key),
                    }
                }
            }

            db.write(batch)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)??;

        Ok(())
    }

    /// Drop all staged operations without writing.
    pub fn rollback(self) {}
}

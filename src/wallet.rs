/// Federation Wallet Contract
///
/// The multisig wallet is an external collaborator; the store drives it
/// through this trait. All calls happen while the store lock is held, so
/// the wallet never races with store mutations. Implementations own their
/// interior mutability.

use bitcoin::{BlockHash, OutPoint, Script, Transaction, Txid};

use crate::chain::ChainTip;

/// Reservation of a multisig output by a withdrawal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendingDetails {
    /// The withdrawal transaction that reserves this output.
    pub transaction_id: Txid,
    /// Height at which the spender was seen in a block, if any.
    pub block_height: Option<i32>,
}

/// One spendable output held by the federation multisig.
#[derive(Debug, Clone)]
pub struct FederationUtxo {
    pub outpoint: OutPoint,
    pub value: i64,
    pub script_pubkey: Script,
    /// Height of the block that created this output. None while unconfirmed.
    pub block_height: Option<i32>,
    pub spending_details: Option<SpendingDetails>,
}

impl FederationUtxo {
    pub fn confirmations(&self, tip_height: i32) -> i32 {
        match self.block_height {
            Some(height) if height <= tip_height => tip_height - height + 1,
            _ => 0,
        }
    }
}

pub trait FederationWallet: Send + Sync {
    /// The wallet's last synced block on this chain. Authoritative: the
    /// store never advances past it.
    fn tip_to_chase(&self) -> ChainTip;

    /// Snapshot of the multisig output set with spending details.
    fn multisig_coins(&self) -> Vec<FederationUtxo>;

    /// Atomically reserve the transaction's inputs as spent by it.
    /// Returns false when any input is unknown or already reserved.
    fn process_transaction(&self, tx: &Transaction) -> bool;

    /// Undo a reservation made by `process_transaction`.
    fn remove_transaction(&self, tx: &Transaction);

    /// Re-point reservations from an old transaction id to a replacement
    /// transaction (a merge changed the hash).
    fn update_spending_transaction(&self, old_id: Txid, new_tx: &Transaction);

    /// Persist wallet state.
    fn save_wallet(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Rewind the wallet above the given fork height.
    fn remove_blocks(&self, fork_height: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Block locator for this wallet's branch, newest first.
    fn block_locator(&self) -> Vec<BlockHash>;

    /// True when the wallet password is available for signing.
    fn is_signing_enabled(&self) -> bool;

    /// Best-effort signing of our federation member's share. Inputs that
    /// cannot be signed are left untouched.
    fn sign_transaction(&self, tx: Transaction) -> Transaction;

    /// Merge signatures from peer partials into the target, input-wise.
    /// Duplicate signatures are idempotent.
    fn combine_signatures(&self, target: &Transaction, partials: &[Transaction]) -> Transaction;
}

/// Deposit / Withdrawal Extraction
///
/// Per-block scanning seams. Deposits are extracted on the counter-chain
/// by an external component and arrive through the matured-block stream;
/// withdrawals are recognized on this chain by matching transactions that
/// spend the federation multisig and carry a 32-byte OP_RETURN deposit id.

use bitcoin::hashes::Hash;
use bitcoin::{Block, Script, Transaction, Txid};

use crate::config::FederatedPegSettings;
use crate::verify::script_pushes;

/// A mature counter-chain deposit, ready for withdrawal on this chain.
#[derive(Debug, Clone)]
pub struct Deposit {
    /// Id of the deposit transaction on the counter-chain.
    pub id: Txid,
    /// Script releasing the funds on this chain.
    pub target_script: Script,
    pub amount: i64,
    /// Counter-chain height at which the deposit matured.
    pub block_number: i32,
}

/// A withdrawal observed in one of our own blocks.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    /// Id of the withdrawal transaction itself.
    pub id: Txid,
    /// Deposit id recovered from the OP_RETURN marker.
    pub deposit_id: Txid,
    pub target_script: Script,
    pub amount: i64,
    /// The full observed transaction.
    pub transaction: Transaction,
}

pub trait DepositExtractor: Send + Sync {
    fn extract_from_block(&self, block: &Block, height: i32) -> Vec<Deposit>;
}

pub trait WithdrawalExtractor: Send + Sync {
    fn extract_from_block(&self, block: &Block, height: i32) -> Vec<Withdrawal>;
}

/// Recognizes federation withdrawals by their OP_RETURN deposit marker.
pub struct OpReturnWithdrawalExtractor {
    multisig_script_pubkey: Script,
}

impl OpReturnWithdrawalExtractor {
    pub fn new(settings: &FederatedPegSettings) -> Self {
        Self {
            multisig_script_pubkey: settings.multisig_script_pubkey(),
        }
    }

    fn deposit_id_marker(script: &Script) -> Option<Txid> {
        let bytes = script.as_bytes();
        if bytes.first() != Some(&0x6A) {
            return None;
        }
        match script_pushes(&bytes[1..]) {
            Some(pushes) if pushes.len() == 1 && pushes[0].len() == 32 => {
                let mut id = [0u8; 32];
                id.copy_from_slice(&pushes[0]);
                Some(Txid::from_inner(id))
            }
            _ => None,
        }
    }
}

impl WithdrawalExtractor for OpReturnWithdrawalExtractor {
    fn extract_from_block(&self, block: &Block, _height: i32) -> Vec<Withdrawal> {
        let mut withdrawals = Vec::new();

        for tx in &block.txdata {
            if tx.is_coin_base() {
                continue;
            }

            let deposit_id = match tx
                .output
                .iter()
                .find_map(|out| Self::deposit_id_marker(&out.script_pubkey))
            {
                Some(id) => id,
                None => continue,
            };

            // The payment output: first output that is neither the marker
            // nor change back to the multisig.
            let payment = tx.output.iter().find(|out| {
                !out.script_pubkey.is_op_return()
                    && out.script_pubkey != self.multisig_script_pubkey
            });
            let payment = match payment {
                Some(payment) => payment,
                None => continue,
            };

            withdrawals.push(Withdrawal {
                id: tx.txid(),
                deposit_id,
                target_script: payment.script_pubkey.clone(),
                amount: payment.value as i64,
                transaction: tx.clone(),
            });
        }

        withdrawals
    }
}

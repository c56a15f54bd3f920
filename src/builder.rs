/// Deterministic Withdrawal Builder
///
/// Builds the unsigned withdrawal transaction for a mature deposit. Every
/// federation member must produce byte-identical output from the same
/// wallet UTXO set, so the builder:
/// - selects coins in canonical (txid bytes, vout) order, no shuffling
/// - emits outputs in a fixed order: payment, change, OP_RETURN
/// - charges the flat configured fee against the payment output
/// - filters coins below the configured maturity
///
/// Input scripts are not verified here; full validation happens when the
/// signature set completes.

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Script, Transaction, TxIn, TxOut, Txid};

use crate::config::FederatedPegSettings;
use crate::wallet::{FederationUtxo, FederationWallet};

/// Canonical coin ordering key: raw txid bytes, then output index.
pub fn canonical_outpoint_key(outpoint: &OutPoint) -> ([u8; 32], u32) {
    (outpoint.txid.into_inner(), outpoint.vout)
}

/// OP_RETURN output carrying the 32 deposit-id bytes verbatim.
fn deposit_marker_script(deposit_id: &Txid) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_RETURN)
        .push_slice(&deposit_id.into_inner())
        .into_script()
}

/// Build the deterministic withdrawal for one deposit. None when the
/// wallet cannot currently fund it; ingestion treats that as a suspension.
pub fn build_deterministic_transaction(
    settings: &FederatedPegSettings,
    wallet: &dyn FederationWallet,
    deposit_id: Txid,
    target_script: &Script,
    amount: i64,
) -> Option<Transaction> {
    let fee = settings.transaction_fee;
    // The payment output is amount minus fee; a non-positive payment is
    // never buildable, regardless of what the caller rejected upstream.
    if amount <= fee {
        return None;
    }

    let multisig_script = settings.multisig_script_pubkey();
    let tip_height = wallet.tip_to_chase().height;

    let mut candidates: Vec<FederationUtxo> = wallet
        .multisig_coins()
        .into_iter()
        .filter(|coin| coin.spending_details.is_none())
        .filter(|coin| coin.script_pubkey == multisig_script)
        .filter(|coin| coin.confirmations(tip_height) >= settings.min_coin_maturity)
        .collect();
    candidates.sort_by_key(|coin| canonical_outpoint_key(&coin.outpoint));

    let mut selected = Vec::new();
    let mut selected_value: i64 = 0;
    for coin in candidates {
        if selected_value >= amount {
            break;
        }
        selected_value += coin.value;
        selected.push(coin);
    }
    if selected_value < amount {
        return None;
    }

    let input: Vec<TxIn> = selected
        .iter()
        .map(|coin| TxIn {
            previous_output: coin.outpoint,
            script_sig: Script::new(),
            sequence: 0xFFFF_FFFF,
            witness: vec![],
        })
        .collect();

    let mut output = vec![TxOut {
        value: (amount - fee) as u64,
        script_pubkey: target_script.clone(),
    }];
    let change = selected_value - amount;
    if change > 0 {
        output.push(TxOut {
            value: change as u64,
            script_pubkey: multisig_script,
        });
    }
    output.push(TxOut {
        value: 0,
        script_pubkey: deposit_marker_script(&deposit_id),
    });

    let tx = Transaction {
        version: 1,
        lock_time: 0,
        input,
        output,
    };

    if wallet.is_signing_enabled() {
        Some(wallet.sign_transaction(tx))
    } else {
        Some(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainTip;
    use crate::wallet::SpendingDetails;
    use bitcoin::consensus::encode::serialize;
    use bitcoin::BlockHash;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct StubWallet {
        tip: ChainTip,
        coins: Mutex<Vec<FederationUtxo>>,
    }

    impl FederationWallet for StubWallet {
        fn tip_to_chase(&self) -> ChainTip {
            self.tip
        }
        fn multisig_coins(&self) -> Vec<FederationUtxo> {
            self.coins.lock().unwrap().clone()
        }
        fn process_transaction(&self, _tx: &Transaction) -> bool {
            true
        }
        fn remove_transaction(&self, _tx: &Transaction) {}
        fn update_spending_transaction(&self, _old_id: Txid, _new_tx: &Transaction) {}
        fn save_wallet(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        fn remove_blocks(
            &self,
            _fork_height: i32,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        fn block_locator(&self) -> Vec<BlockHash> {
            vec![self.tip.hash]
        }
        fn is_signing_enabled(&self) -> bool {
            false
        }
        fn sign_transaction(&self, tx: Transaction) -> Transaction {
            tx
        }
        fn combine_signatures(
            &self,
            target: &Transaction,
            _partials: &[Transaction],
        ) -> Transaction {
            target.clone()
        }
    }

    fn settings() -> FederatedPegSettings {
        FederatedPegSettings {
            network: bitcoin::Network::Regtest,
            redeem_script: Builder::new().push_int(1).into_script(),
            transaction_fee: 100,
            min_coin_maturity: 2,
            counter_chain_start_height: 0,
            data_root: PathBuf::from("/tmp"),
            sync_batch_size: 100,
        }
    }

    fn coin(settings: &FederatedPegSettings, txid_byte: u8, vout: u32, value: i64, height: i32) -> FederationUtxo {
        FederationUtxo {
            outpoint: OutPoint {
                txid: Txid::from_inner([txid_byte; 32]),
                vout,
            },
            value,
            script_pubkey: settings.multisig_script_pubkey(),
            block_height: Some(height),
            spending_details: None,
        }
    }

    fn wallet_with(settings: &FederatedPegSettings, coins: Vec<FederationUtxo>) -> StubWallet {
        let _ = settings;
        StubWallet {
            tip: ChainTip {
                hash: BlockHash::from_inner([0xAA; 32]),
                height: 100,
            },
            coins: Mutex::new(coins),
        }
    }

    fn target() -> Script {
        Builder::new().push_int(7).into_script()
    }

    #[test]
    fn identical_output_regardless_of_coin_order() {
        let settings = settings();
        let coins = vec![
            coin(&settings, 3, 0, 600, 10),
            coin(&settings, 1, 1, 600, 10),
            coin(&settings, 1, 0, 600, 10),
        ];
        let mut reversed = coins.clone();
        reversed.reverse();

        let deposit = Txid::from_inner([0xDD; 32]);
        let a = build_deterministic_transaction(
            &settings,
            &wallet_with(&settings, coins),
            deposit,
            &target(),
            1_000,
        )
        .unwrap();
        let b = build_deterministic_transaction(
            &settings,
            &wallet_with(&settings, reversed),
            deposit,
            &target(),
            1_000,
        )
        .unwrap();

        assert_eq!(serialize(&a), serialize(&b));
        // Canonical input order: txid [1;32] vout 0, then vout 1
        assert_eq!(a.input[0].previous_output.vout, 0);
        assert_eq!(a.input[1].previous_output.vout, 1);
        assert_eq!(a.input[0].previous_output.txid, Txid::from_inner([1u8; 32]));
    }

    #[test]
    fn pays_amount_minus_fee_with_change_and_marker() {
        let settings = settings();
        let wallet = wallet_with(&settings, vec![coin(&settings, 1, 0, 5_000, 10)]);
        let deposit = Txid::from_inner([0xDD; 32]);

        let tx =
            build_deterministic_transaction(&settings, &wallet, deposit, &target(), 1_000).unwrap();

        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].value, 900); // amount - fee
        assert_eq!(tx.output[0].script_pubkey, target());
        assert_eq!(tx.output[1].value, 4_000); // change back to the multisig
        assert_eq!(tx.output[1].script_pubkey, settings.multisig_script_pubkey());
        assert_eq!(tx.output[2].value, 0);
        assert!(tx.output[2].script_pubkey.is_op_return());
        let marker = tx.output[2].script_pubkey.as_bytes();
        assert_eq!(&marker[marker.len() - 32..], &deposit.into_inner());
    }

    #[test]
    fn omits_zero_change() {
        let settings = settings();
        let wallet = wallet_with(&settings, vec![coin(&settings, 1, 0, 1_000, 10)]);
        let tx = build_deterministic_transaction(
            &settings,
            &wallet,
            Txid::from_inner([0xDD; 32]),
            &target(),
            1_000,
        )
        .unwrap();
        assert_eq!(tx.output.len(), 2);
        assert!(tx.output[1].script_pubkey.is_op_return());
    }

    #[test]
    fn insufficient_funds_returns_none() {
        let settings = settings();
        let wallet = wallet_with(&settings, vec![coin(&settings, 1, 0, 500, 10)]);
        assert!(build_deterministic_transaction(
            &settings,
            &wallet,
            Txid::from_inner([0xDD; 32]),
            &target(),
            1_000
        )
        .is_none());
    }

    #[test]
    fn skips_immature_and_reserved_coins() {
        let settings = settings();
        let mut reserved = coin(&settings, 2, 0, 5_000, 10);
        reserved.spending_details = Some(SpendingDetails {
            transaction_id: Txid::from_inner([0xEE; 32]),
            block_height: None,
        });
        let immature = coin(&settings, 3, 0, 5_000, 100); // 1 confirmation < maturity 2
        let wallet = wallet_with(&settings, vec![reserved, immature]);

        assert!(build_deterministic_transaction(
            &settings,
            &wallet,
            Txid::from_inner([0xDD; 32]),
            &target(),
            1_000
        )
        .is_none());
    }

    #[test]
    fn amount_not_exceeding_fee_returns_none() {
        let settings = settings();
        let wallet = wallet_with(&settings, vec![coin(&settings, 1, 0, 5_000, 10)]);
        assert!(build_deterministic_transaction(
            &settings,
            &wallet,
            Txid::from_inner([0xDD; 32]),
            &target(),
            100
        )
        .is_none());
    }
}

/// Fully-Signed Withdrawal Validation
///
/// Checks whether a merged withdrawal carries a complete federation
/// signature set:
/// - every input is reserved in the wallet for exactly this transaction
/// - every script_sig is `OP_0 <sig>... <redeem_script>` with the
///   federation redeem script embedded verbatim
/// - signatures verify in key order over the legacy sighash (ALL), with
///   at least M valid signatures per input
/// - the realized fee meets the configured minimum
///
/// Any failure yields false and the transfer stays Partial.

use bitcoin::hashes::Hash;
use bitcoin::{Script, Transaction};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::config::FederatedPegSettings;
use crate::wallet::FederationUtxo;

const SIGHASH_ALL: u8 = 0x01;

/// The federation quorum as encoded in the redeem script.
#[derive(Debug, Clone)]
pub struct FederationQuorum {
    pub required: usize,
    pub pubkeys: Vec<Vec<u8>>,
}

/// Parse a standard `OP_m <pk>... OP_n OP_CHECKMULTISIG` redeem script.
pub fn parse_redeem_script(redeem: &Script) -> Option<FederationQuorum> {
    let bytes = redeem.as_bytes();
    if bytes.len() < 4 {
        return None;
    }

    let m_op = bytes[0];
    if !(0x51..=0x60).contains(&m_op) {
        return None;
    }
    let required = (m_op - 0x50) as usize;

    let mut pubkeys = Vec::new();
    let mut pos = 1;
    while pos < bytes.len() {
        let len = bytes[pos] as usize;
        if len != 33 && len != 65 {
            break;
        }
        if pos + 1 + len > bytes.len() {
            return None;
        }
        pubkeys.push(bytes[pos + 1..pos + 1 + len].to_vec());
        pos += 1 + len;
    }

    if pos + 2 != bytes.len() {
        return None;
    }
    let n_op = bytes[pos];
    if !(0x51..=0x60).contains(&n_op) || (n_op - 0x50) as usize != pubkeys.len() {
        return None;
    }
    if bytes[pos + 1] != 0xAE {
        return None;
    }
    if required == 0 || required > pubkeys.len() {
        return None;
    }

    Some(FederationQuorum { required, pubkeys })
}

/// Split a push-only script (e.g. a P2SH script_sig) into its data pushes.
/// Returns None on any non-push opcode.
pub(crate) fn script_pushes(bytes: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let op = bytes[pos];
        pos += 1;
        match op {
            0x00 => pushes.push(Vec::new()),
            0x01..=0x4B => {
                let len = op as usize;
                if pos + len > bytes.len() {
                    return None;
                }
                pushes.push(bytes[pos..pos + len].to_vec());
                pos += len;
            }
            0x4C => {
                if pos >= bytes.len() {
                    return None;
                }
                let len = bytes[pos] as usize;
                pos += 1;
                if pos + len > bytes.len() {
                    return None;
                }
                pushes.push(bytes[pos..pos + len].to_vec());
                pos += len;
            }
            0x4D => {
                if pos + 2 > bytes.len() {
                    return None;
                }
                let len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
                pos += 2;
                if pos + len > bytes.len() {
                    return None;
                }
                pushes.push(bytes[pos..pos + len].to_vec());
                pos += len;
            }
            _ => return None,
        }
    }
    Some(pushes)
}

/// Count the signatures already present in one multisig script_sig.
pub fn input_signature_count(script_sig: &Script, redeem: &Script) -> usize {
    match script_pushes(script_sig.as_bytes()) {
        Some(pushes) if pushes.len() >= 2 && pushes.last().map(|p| p.as_slice()) == Some(redeem.as_bytes()) => {
            pushes.len() - 2
        }
        _ => 0,
    }
}

/// Produce one DER signature (with sighash byte) for the given input.
/// This is the signing primitive wallet implementations compose.
pub fn sign_input(
    tx: &Transaction,
    input_index: usize,
    redeem: &Script,
    key: &SecretKey,
) -> Vec<u8> {
    let secp = Secp256k1::new();
    let sighash = tx.signature_hash(input_index, redeem, SIGHASH_ALL as u32);
    let message = Message::from_slice(&sighash.into_inner()).expect("sighash is 32 bytes");
    let mut sig = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
    sig.push(SIGHASH_ALL);
    sig
}

/// Assemble `OP_0 <sig>... <redeem>` from an ordered signature list.
pub fn multisig_script_sig(signatures: &[Vec<u8>], redeem: &Script) -> Script {
    let mut builder = bitcoin::blockdata::script::Builder::new().push_int(0);
    for sig in signatures {
        builder = builder.push_slice(sig);
    }
    builder.push_slice(redeem.as_bytes()).into_script()
}

fn verify_input_signatures(
    tx: &Transaction,
    input_index: usize,
    signatures: &[Vec<u8>],
    quorum: &FederationQuorum,
    redeem: &Script,
) -> bool {
    if signatures.len() < quorum.required {
        return false;
    }

    let secp = Secp256k1::verification_only();
    let sighash = tx.signature_hash(input_index, redeem, SIGHASH_ALL as u32);
    let message = match Message::from_slice(&sighash.into_inner()) {
        Ok(message) => message,
        Err(_) => return false,
    };

    // OP_CHECKMULTISIG semantics: signatures must appear in key order,
    // each key consumed at most once.
    let mut key_cursor = 0;
    for sig_bytes in signatures {
        let (der, sighash_byte) = match sig_bytes.split_last() {
            Some((last, der)) => (der, *last),
            None => return false,
        };
        if sighash_byte != SIGHASH_ALL {
            return false;
        }
        let signature = match Signature::from_der(der) {
            Ok(signature) => signature,
            Err(_) => return false,
        };

        let mut matched = false;
        while key_cursor < quorum.pubkeys.len() {
            let pubkey = match PublicKey::from_slice(&quorum.pubkeys[key_cursor]) {
                Ok(pubkey) => pubkey,
                Err(_) => return false,
            };
            key_cursor += 1;
            if secp.verify_ecdsa(&message, &signature, &pubkey).is_ok() {
                matched = true;
                break;
            }
        }
        if !matched {
            return false;
        }
    }
    true
}

/// Validate a candidate fully-signed withdrawal against the wallet's
/// multisig coin snapshot.
pub fn validate_fully_signed(
    settings: &FederatedPegSettings,
    coins: &[FederationUtxo],
    tx: &Transaction,
) -> bool {
    let quorum = match parse_redeem_script(&settings.redeem_script) {
        Some(quorum) => quorum,
        None => return false,
    };
    let txid = tx.txid();

    let mut total_in: i64 = 0;
    for (index, input) in tx.input.iter().enumerate() {
        let coin = match coins
            .iter()
            .find(|coin| coin.outpoint == input.previous_output)
        {
            Some(coin) => coin,
            None => return false,
        };
        match &coin.spending_details {
            Some(details) if details.transaction_id == txid => {}
            _ => return false,
        }
        total_in += coin.value;

        let pushes = match script_pushes(input.script_sig.as_bytes()) {
            Some(pushes) => pushes,
            None => return false,
        };
        // OP_0 dummy, at least one signature, redeem script last
        if pushes.len() < 3 || !pushes[0].is_empty() {
            return false;
        }
        if pushes.last().map(|p| p.as_slice()) != Some(settings.redeem_script.as_bytes()) {
            return false;
        }
        let signatures = &pushes[1..pushes.len() - 1];
        if !verify_input_signatures(tx, index, signatures, &quorum, &settings.redeem_script) {
            return false;
        }
    }

    let total_out: i64 = tx.output.iter().map(|out| out.value as i64).sum();
    total_in - total_out >= settings.transaction_fee
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::SpendingDetails;
    use bitcoin::blockdata::opcodes;
    use bitcoin::blockdata::script::Builder;
    use bitcoin::{OutPoint, TxIn, TxOut, Txid};
    use std::path::PathBuf;

    fn keys() -> Vec<SecretKey> {
        (1u8..=3).map(|seed| SecretKey::from_slice(&[seed; 32]).unwrap()).collect()
    }

    fn redeem(required: i64) -> Script {
        let secp = Secp256k1::new();
        let mut builder = Builder::new().push_int(required);
        for key in keys() {
            builder = builder.push_slice(&PublicKey::from_secret_key(&secp, &key).serialize());
        }
        builder
            .push_int(3)
            .push_opcode(opcodes::all::OP_CHECKMULTISIG)
            .into_script()
    }

    fn settings() -> FederatedPegSettings {
        FederatedPegSettings {
            network: bitcoin::Network::Regtest,
            redeem_script: redeem(2),
            transaction_fee: 100,
            min_coin_maturity: 1,
            counter_chain_start_height: 0,
            data_root: PathBuf::from("/tmp"),
            sync_batch_size: 100,
        }
    }

    fn unsigned_tx(outpoint: OutPoint) -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: vec![],
            }],
            output: vec![TxOut {
                value: 900,
                script_pubkey: Builder::new().push_int(7).into_script(),
            }],
        }
    }

    fn sign_with(tx: &Transaction, redeem: &Script, signer_indexes: &[usize]) -> Transaction {
        let keys = keys();
        let mut signed = tx.clone();
        let sigs: Vec<Vec<u8>> = signer_indexes
            .iter()
            .map(|&i| sign_input(tx, 0, redeem, &keys[i]))
            .collect();
        signed.input[0].script_sig = multisig_script_sig(&sigs, redeem);
        signed
    }

    fn coin_for(tx: &Transaction, settings: &FederatedPegSettings) -> FederationUtxo {
        FederationUtxo {
            outpoint: tx.input[0].previous_output,
            value: 1_000,
            script_pubkey: settings.multisig_script_pubkey(),
            block_height: Some(1),
            spending_details: Some(SpendingDetails {
                transaction_id: tx.txid(),
                block_height: None,
            }),
        }
    }

    #[test]
    fn parses_quorum_from_redeem_script() {
        let quorum = parse_redeem_script(&redeem(2)).unwrap();
        assert_eq!(quorum.required, 2);
        assert_eq!(quorum.pubkeys.len(), 3);
    }

    #[test]
    fn accepts_complete_signature_set() {
        let settings = settings();
        let unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        let signed = sign_with(&unsigned, &settings.redeem_script, &[0, 2]);
        let coin = coin_for(&signed, &settings);

        assert!(validate_fully_signed(&settings, &[coin], &signed));
    }

    #[test]
    fn rejects_below_quorum() {
        let settings = settings();
        let unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        let signed = sign_with(&unsigned, &settings.redeem_script, &[1]);
        let coin = coin_for(&signed, &settings);

        assert!(!validate_fully_signed(&settings, &[coin], &signed));
    }

    #[test]
    fn rejects_out_of_order_signatures() {
        let settings = settings();
        let unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        // Key order must be ascending; 2 then 0 violates CHECKMULTISIG order
        let signed = sign_with(&unsigned, &settings.redeem_script, &[2, 0]);
        let coin = coin_for(&signed, &settings);

        assert!(!validate_fully_signed(&settings, &[coin], &signed));
    }

    #[test]
    fn rejects_unreserved_input() {
        let settings = settings();
        let unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        let signed = sign_with(&unsigned, &settings.redeem_script, &[0, 1]);
        let mut coin = coin_for(&signed, &settings);
        coin.spending_details = None;

        assert!(!validate_fully_signed(&settings, &[coin], &signed));
    }

    #[test]
    fn rejects_reservation_by_other_transaction() {
        let settings = settings();
        let unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        let signed = sign_with(&unsigned, &settings.redeem_script, &[0, 1]);
        let mut coin = coin_for(&signed, &settings);
        coin.spending_details = Some(SpendingDetails {
            transaction_id: Txid::from_inner([0xBB; 32]),
            block_height: None,
        });

        assert!(!validate_fully_signed(&settings, &[coin], &signed));
    }

    #[test]
    fn rejects_fee_below_minimum() {
        let settings = settings();
        let mut unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        unsigned.output[0].value = 950; // realized fee 50 < 100
        let signed = sign_with(&unsigned, &settings.redeem_script, &[0, 1]);
        let coin = coin_for(&signed, &settings);

        assert!(!validate_fully_signed(&settings, &[coin], &signed));
    }

    #[test]
    fn counts_existing_signatures() {
        let settings = settings();
        let unsigned = unsigned_tx(OutPoint {
            txid: Txid::from_inner([1u8; 32]),
            vout: 0,
        });
        assert_eq!(input_signature_count(&unsigned.input[0].script_sig, &settings.redeem_script), 0);

        let signed = sign_with(&unsigned, &settings.redeem_script, &[0, 1]);
        assert_eq!(input_signature_count(&signed.input[0].script_sig, &settings.redeem_script), 2);
    }
}

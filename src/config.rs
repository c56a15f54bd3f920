pub use config::Config;
pub use once_cell::sync::OnceCell;
use std::error::Error;
use std::path::PathBuf;

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::util::address::Address;
use bitcoin::{Network, Script};
use serde::Deserialize;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/utilities
pub fn load_config(path: &str) -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

/// Typed settings consumed by the transfer store.
#[derive(Debug, Clone)]
pub struct FederatedPegSettings {
    pub network: Network,
    /// The federation's M-of-N redeem script.
    pub redeem_script: Script,
    /// Flat withdrawal fee in base units.
    pub transaction_fee: i64,
    /// Confirmations a multisig coin needs before the builder may select it.
    pub min_coin_maturity: i32,
    /// First counter-chain height this federation watches for deposits.
    pub counter_chain_start_height: i32,
    /// Root under which the per-federation data directory is created.
    pub data_root: PathBuf,
    /// Local-chain blocks consumed per synchronizer batch.
    pub sync_batch_size: usize,
}

/// The `[federation]` section as it appears in config.toml.
#[derive(Debug, Deserialize)]
struct FederationSection {
    network: Option<String>,
    redeem_script: String,
    transaction_fee: Option<i64>,
    min_coin_maturity: Option<i32>,
    counter_chain_start_height: Option<i32>,
}

impl FederatedPegSettings {
    pub fn from_config(config: &Config) -> Result<FederatedPegSettings, Box<dyn Error>> {
        let section: FederationSection = config
            .get("federation")
            .map_err(|e| format!("Bad [federation] section in config: {}", e))?;

        let network = match section.network.as_deref().unwrap_or("main") {
            "main" | "mainnet" => Network::Bitcoin,
            "test" | "testnet" => Network::Testnet,
            "regtest" => Network::Regtest,
            other => return Err(format!("Unknown federation.network: {}", other).into()),
        };

        let redeem_script = Script::from(hex::decode(section.redeem_script)?);

        let data_root = config
            .get_string("paths.data_root")
            .map_err(|e| format!("Missing paths.data_root in config: {}", e))?;

        Ok(FederatedPegSettings {
            network,
            redeem_script,
            transaction_fee: section.transaction_fee.unwrap_or(10_000),
            min_coin_maturity: section.min_coin_maturity.unwrap_or(1),
            counter_chain_start_height: section.counter_chain_start_height.unwrap_or(0),
            data_root: PathBuf::from(data_root),
            sync_batch_size: config.get_int("sync.batch_size").unwrap_or(100) as usize,
        })
    }

    /// P2SH scriptPubKey of the federation multisig. Change outputs and
    /// withdrawal detection both key off this script.
    pub fn multisig_script_pubkey(&self) -> Script {
        let script_hash = hash160::Hash::hash(self.redeem_script.as_bytes());
        Builder::new()
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(&script_hash.into_inner())
            .push_opcode(opcodes::all::OP_EQUAL)
            .into_script()
    }

    pub fn multisig_address(&self) -> String {
        Address::p2sh(&self.redeem_script, self.network).to_string()
    }

    /// Per-federation data directory: `<root>/federatedTransfers<address>/`
    pub fn data_dir(&self) -> PathBuf {
        self.data_root
            .join(format!("federatedTransfers{}", self.multisig_address()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn redeem_2_of_3() -> Script {
        let secp = Secp256k1::new();
        let mut builder = Builder::new().push_int(2);
        for seed in 1u8..=3 {
            let key = SecretKey::from_slice(&[seed; 32]).unwrap();
            let pubkey = PublicKey::from_secret_key(&secp, &key);
            builder = builder.push_slice(&pubkey.serialize());
        }
        builder
            .push_int(3)
            .push_opcode(opcodes::all::OP_CHECKMULTISIG)
            .into_script()
    }

    fn settings() -> FederatedPegSettings {
        FederatedPegSettings {
            network: Network::Regtest,
            redeem_script: redeem_2_of_3(),
            transaction_fee: 1_000,
            min_coin_maturity: 1,
            counter_chain_start_height: 0,
            data_root: PathBuf::from("/tmp"),
            sync_batch_size: 100,
        }
    }

    #[test]
    fn multisig_script_pubkey_is_p2sh() {
        let script = settings().multisig_script_pubkey();
        assert!(script.is_p2sh());
    }

    #[test]
    fn data_dir_embeds_multisig_address() {
        let settings = settings();
        let dir = settings.data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("federatedTransfers"));
        assert!(name.contains(&settings.multisig_address()));
    }
}

use std::collections::HashMap;

use clap::Parser;
use rocksdb::{Options, DB};

use fedpeg::config::{load_config, FederatedPegSettings};
use fedpeg::kv::{CF_COMMON, CF_TRANSFERS, NEXT_MATURE_TIP_KEY, REPOSITORY_TIP_KEY};
use fedpeg::transfer::CrossChainTransfer;

/// Inspect a federated transfer store data directory.
#[derive(Parser)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    let settings = FederatedPegSettings::from_config(&config)?;
    let data_dir = settings.data_dir();

    let cf_names = vec!["default", CF_TRANSFERS, CF_COMMON];
    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, &data_dir, &cf_names, false)?;

    println!("=== STORE ===");
    println!("Data dir: {}", data_dir.display());
    println!("Multisig address: {}", settings.multisig_address());

    let cf_common = db.cf_handle(CF_COMMON).ok_or("common CF not found")?;
    match db.get_cf(&cf_common, REPOSITORY_TIP_KEY)? {
        Some(bytes) if bytes.len() == 36 => {
            let height = i32::from_be_bytes(bytes[32..36].try_into()?);
            let mut hash = bytes[..32].to_vec();
            hash.reverse();
            println!("Tip: {} at height {}", hex::encode(hash), height);
        }
        Some(bytes) => println!("Tip: CORRUPT ({} bytes)", bytes.len()),
        None => println!("Tip: not set"),
    }
    match db.get_cf(&cf_common, NEXT_MATURE_TIP_KEY)? {
        Some(bytes) => {
            let height = i32::from_be_bytes(bytes.as_slice().try_into()?);
            println!("Next mature deposit height: {}", height);
        }
        None => println!("Next mature deposit height: not set"),
    }

    println!("\n=== TRANSFERS ===");
    let cf_transfers = db.cf_handle(CF_TRANSFERS).ok_or("transfers CF not found")?;
    let mut by_status: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;
    let mut corrupt = 0usize;

    for item in db.iterator_cf(&cf_transfers, rocksdb::IteratorMode::Start) {
        let (key, value) = item?;
        total += 1;
        match CrossChainTransfer::decode(&value) {
            Ok(transfer) => {
                *by_status.entry(transfer.status.to_string()).or_default() += 1;
            }
            Err(e) => {
                corrupt += 1;
                println!("CORRUPT row {}: {}", hex::encode(&key), e);
            }
        }
    }

    println!("Total transfers: {}", total);
    let mut statuses: Vec<_> = by_status.into_iter().collect();
    statuses.sort();
    for (status, count) in statuses {
        println!("  {}: {}", status, count);
    }
    if corrupt > 0 {
        println!("Corrupt rows: {}", corrupt);
    }

    Ok(())
}

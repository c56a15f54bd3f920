pub mod builder;
pub mod chain;
pub mod config;
pub mod events;
pub mod extractor;
pub mod index;
pub mod kv;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod tracker;
pub mod transfer;
pub mod verify;
pub mod wallet;


pub use config::FederatedPegSettings;
pub use store::CrossChainTransferStore;
pub use transfer::{CrossChainTransfer, TransferStatus};

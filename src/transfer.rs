/// Cross-Chain Transfer Record
///
/// The one persisted entity of the transfer store. Each record tracks a
/// single counter-chain deposit through its withdrawal lifecycle:
/// Suspended -> Partial -> FullySigned -> SeenInBlock, with backwards
/// transitions on reorg and a terminal Rejected state for deposits that
/// can never be paid (amount below the withdrawal fee).
///
/// Records are serialized with a self-describing binary layout:
///   status:u8 | deposit_id:32 | has_deposit_height:u8 | [deposit_height:i32 LE]
///   | amount:i64 LE | target_script | has_partial_tx:u8 | [partial_tx]
///   | has_block:u8 | [block_hash:32 | block_height:i32 LE]
/// Scripts and transactions use bitcoin consensus encoding, which carries
/// its own length prefix.

use std::io::{Cursor, Read};

use bitcoin::consensus::encode::{serialize, Decodable};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Script, Transaction, Txid};
use byteorder::{LittleEndian, ReadBytesExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    /// No withdrawal transaction could be built yet (missing UTXOs).
    Suspended,
    /// A deterministic withdrawal transaction exists, not fully signed.
    Partial,
    /// The withdrawal carries a full federation signature set.
    FullySigned,
    /// The withdrawal was observed in a block on this chain.
    SeenInBlock,
    /// The deposit can never be withdrawn (amount below the flat fee).
    Rejected,
}

impl TransferStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            TransferStatus::Suspended => 0,
            TransferStatus::Partial => 1,
            TransferStatus::FullySigned => 2,
            TransferStatus::SeenInBlock => 3,
            TransferStatus::Rejected => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<TransferStatus> {
        match value {
            0 => Some(TransferStatus::Suspended),
            1 => Some(TransferStatus::Partial),
            2 => Some(TransferStatus::FullySigned),
            3 => Some(TransferStatus::SeenInBlock),
            4 => Some(TransferStatus::Rejected),
            _ => None,
        }
    }

    /// All variants, in storage-byte order. Used for index rebuilds.
    pub fn all() -> [TransferStatus; 5] {
        [
            TransferStatus::Suspended,
            TransferStatus::Partial,
            TransferStatus::FullySigned,
            TransferStatus::SeenInBlock,
            TransferStatus::Rejected,
        ]
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Suspended => "Suspended",
            TransferStatus::Partial => "Partial",
            TransferStatus::FullySigned => "FullySigned",
            TransferStatus::SeenInBlock => "SeenInBlock",
            TransferStatus::Rejected => "Rejected",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct CrossChainTransfer {
    /// Id of the source-chain deposit transaction. Primary key, immutable.
    pub deposit_id: Txid,
    /// Counter-chain height at which the deposit matured. None when the
    /// transfer was first observed via our own block.
    pub deposit_height: Option<i32>,
    /// Output script locking the released funds on this chain.
    pub target_script: Script,
    /// Amount in base units.
    pub amount: i64,
    /// Current draft withdrawal transaction. None while Suspended/Rejected.
    pub partial_transaction: Option<Transaction>,
    /// Location on this chain where the withdrawal was observed.
    /// Present iff status is SeenInBlock.
    pub block_hash: Option<BlockHash>,
    pub block_height: Option<i32>,
    pub status: TransferStatus,
}

impl CrossChainTransfer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(self.status.as_u8());
        out.extend_from_slice(&self.deposit_id.into_inner());
        match self.deposit_height {
            Some(height) => {
                out.push(1);
                out.extend_from_slice(&height.to_le_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&serialize(&self.target_script));
        match &self.partial_transaction {
            Some(tx) => {
                out.push(1);
                out.extend_from_slice(&serialize(tx));
            }
            None => out.push(0),
        }
        match (&self.block_hash, self.block_height) {
            (Some(hash), Some(height)) => {
                out.push(1);
                out.extend_from_slice(&hash.into_inner());
                out.extend_from_slice(&height.to_le_bytes());
            }
            _ => out.push(0),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<CrossChainTransfer, Box<dyn std::error::Error + Send + Sync>> {
        let mut cursor = Cursor::new(bytes);

        let status = TransferStatus::from_u8(cursor.read_u8()?)
            .ok_or("Unknown transfer status byte")?;

        let mut deposit_id = [0u8; 32];
        cursor.read_exact(&mut deposit_id)?;
        let deposit_id = Txid::from_inner(deposit_id);

        let deposit_height = match cursor.read_u8()? {
            0 => None,
            _ => Some(cursor.read_i32::<LittleEndian>()?),
        };

        let amount = cursor.read_i64::<LittleEndian>()?;

        let target_script: Script = Decodable::consensus_decode(&mut cursor)?;

        let partial_transaction = match cursor.read_u8()? {
            0 => None,
            _ => Some(Decodable::consensus_decode(&mut cursor)?),
        };

        let (block_hash, block_height) = match cursor.read_u8()? {
            0 => (None, None),
            _ => {
                let mut hash = [0u8; 32];
                cursor.read_exact(&mut hash)?;
                let height = cursor.read_i32::<LittleEndian>()?;
                (Some(BlockHash::from_inner(hash)), Some(height))
            }
        };

        if (status == TransferStatus::SeenInBlock) != block_hash.is_some() {
            return Err(format!(
                "Corrupt transfer record {}: status {} with block present = {}",
                deposit_id,
                status,
                block_hash.is_some()
            )
            .into());
        }

        Ok(CrossChainTransfer {
            deposit_id,
            deposit_height,
            target_script,
            amount,
            partial_transaction,
            block_hash,
            block_height,
            status,
        })
    }

    /// Storage key in the transfers table.
    pub fn key(&self) -> [u8; 32] {
        self.deposit_id.into_inner()
    }
}

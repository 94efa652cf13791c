// `DepositEvent` logs are laid out as 18 EVM words.
// The deposit contract encodes every field as `bytes`, so each value follows an offset word and a
// length word and is padded to a word boundary:
// ```text
// words  0..5  offsets of pubkey, withdrawal_credentials, amount, signature, index
// words  5..8  pubkey length, pubkey (48 bytes + 16 bytes of padding)
// words  8..10 withdrawal_credentials length, withdrawal_credentials
// words 10..12 amount length, amount (little-endian u64 + 24 bytes of padding)
// words 12..16 signature length, signature (96 bytes)
// words 16..18 index length, index (little-endian u64 + 24 bytes of padding)
// ```
//
// See <https://github.com/ethereum/consensus-specs/blob/dev/solidity_deposit_contract/deposit_contract.sol>.

use core::ops::Range;

use hex_literal::hex;
use serde::Deserialize;
use thiserror::Error;
use types::{
    containers::{Deposit, Eth1Deposit},
    primitives::{ExecutionBlockHash, PublicKeyBytes, SignatureBytes, H256, U64},
};

use crate::node::NodeError;

pub const TOPIC: H256 = H256(hex!(
    "649bbc62d0e31342afea4e5cd82d4049e7e1ee912fc0889aa790803be39038c5"
));

const LENGTH: usize = 18 * 32;

const PUBKEY: Range<usize> = 192..240;
const WITHDRAWAL_CREDENTIALS: Range<usize> = 288..320;
const AMOUNT: Range<usize> = 352..360;
const SIGNATURE: Range<usize> = 416..512;
const INDEX: Range<usize> = 544..552;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    block_number: U64,
    block_hash: ExecutionBlockHash,
    transaction_hash: H256,
    log_index: U64,
    topics: Vec<H256>,
    data: String,
    #[serde(default)]
    removed: bool,
}

pub fn decode(resource: &str, log: RawLog) -> Result<Eth1Deposit, NodeError> {
    try_decode(log).map_err(|error| NodeError::malformed(resource, error))
}

fn try_decode(log: RawLog) -> Result<Eth1Deposit, Error> {
    let RawLog {
        block_number,
        block_hash,
        transaction_hash,
        log_index,
        topics,
        data,
        removed,
    } = log;

    let log_index = log_index.as_u64();

    if topics != [TOPIC] {
        return Err(Error::UnexpectedTopics { log_index });
    }

    if removed {
        return Err(Error::Removed { log_index });
    }

    let data = hex::decode(data.trim_start_matches("0x"))?;

    if data.len() != LENGTH {
        return Err(Error::WrongLength {
            log_index,
            length: data.len(),
        });
    }

    let field = |range: Range<usize>| {
        data.get(range)
            .ok_or(Error::WrongLength {
                log_index,
                length: data.len(),
            })
    };

    let deposit = Deposit {
        pubkey: PublicKeyBytes::from_slice(field(PUBKEY)?),
        withdrawal_credentials: H256::from_slice(field(WITHDRAWAL_CREDENTIALS)?),
        amount: little_endian(field(AMOUNT)?),
        signature: SignatureBytes::from_slice(field(SIGNATURE)?),
    };

    Ok(Eth1Deposit {
        block_number: block_number.as_u64(),
        block_hash,
        transaction_hash,
        log_index,
        deposit,
        index: little_endian(field(INDEX)?),
    })
}

fn little_endian(bytes: &[u8]) -> u64 {
    let mut word = [0; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

#[derive(Debug, Error)]
enum Error {
    #[error("log {log_index} has unexpected topics")]
    UnexpectedTopics { log_index: u64 },
    #[error("log {log_index} has been removed")]
    Removed { log_index: u64 },
    #[error("log {log_index} data has {length} bytes instead of {LENGTH}")]
    WrongLength { log_index: u64, length: usize },
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

pub use ethereum_types::{H160, H256, U256, U64};

use fixed_hash::construct_fixed_hash;
use impl_serde::impl_fixed_hash_serde;

pub type DepositIndex = u64;
pub type Epoch = u64;
pub type ExecutionAddress = H160;
pub type ExecutionBlockHash = H256;
pub type ExecutionBlockNumber = u64;
pub type Gwei = u64;
pub type ParticipationFlags = u8;
pub type Slot = u64;
pub type UnixSeconds = u64;
pub type ValidatorIndex = u64;
pub type WithdrawalIndex = u64;

/// Signed difference of two [`Gwei`] amounts.
pub type GweiDelta = i64;

/// Amounts denominated in wei, such as transaction values and gas prices.
pub type Wei = U256;

pub const PUBLIC_KEY_SIZE: usize = 48;
pub const SIGNATURE_SIZE: usize = 96;

construct_fixed_hash! {
    /// A compressed BLS public key. Never decompressed or verified.
    pub struct PublicKeyBytes(PUBLIC_KEY_SIZE);
}

impl_fixed_hash_serde!(PublicKeyBytes, PUBLIC_KEY_SIZE);

construct_fixed_hash! {
    pub struct SignatureBytes(SIGNATURE_SIZE);
}

impl_fixed_hash_serde!(SignatureBytes, SIGNATURE_SIZE);

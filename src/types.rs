//! Core type definitions for the storechain consensus engine.
//!
//! This module contains the fundamental data structures shared by every
//! other component: identifiers, currency, spend conditions, coin and fund
//! outputs, file contracts, transactions and blocks, together with the
//! ed25519 wrappers used to authorise spending.

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Base unit of account. Every coin value, payout and fee is a `Currency`.
pub type Currency = u128;

/// Height of a block above genesis (genesis is 0).
pub type BlockHeight = u64;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Raw SHA-256 output.
pub type Hash256 = [u8; 32];

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error")]
    HashConversionError,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
}

/// Domain separators so that identifiers of different kinds never collide.
const SPECIFIER_COIN_OUTPUT: &[u8] = b"coin output";
const SPECIFIER_FUND_OUTPUT: &[u8] = b"fund output";
const SPECIFIER_FILE_CONTRACT: &[u8] = b"file contract";
const SPECIFIER_STORAGE_PROOF: &[u8] = b"storage proof";
const SPECIFIER_CLAIM_OUTPUT: &[u8] = b"claim output";
const SPECIFIER_MINER_PAYOUT: &[u8] = b"miner payout";

/// Format a 32-byte hash as a hexadecimal string.
///
/// # Arguments
///
/// * `bytes` - The 32-byte hash to format
///
/// # Returns
///
/// A lowercase hexadecimal string representation
pub fn format_hex(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

/// SHA-256 over the concatenation of `parts`.
pub fn hash_all(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Canonical encoding used for hashing, size limits and persistence.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CryptoError> {
    bincode::serialize(value).map_err(|_| CryptoError::HashConversionError)
}

fn hash_encoded<T: Serialize + ?Sized>(prefix: &[u8], value: &T) -> Result<Hash256, CryptoError> {
    let encoded = encode(value)?;
    Ok(hash_all(&[prefix, &encoded]))
}

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Hash256);

        impl $name {
            pub fn from_bytes(bytes: &[u8; 32]) -> Self {
                $name(*bytes)
            }

            pub fn to_bytes(&self) -> [u8; 32] {
                self.0
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&format_hex(&self.0))
            }
        }
    };
}

hash_id!(
    /// Content hash of a block header.
    BlockId
);
hash_id!(
    /// Hash of a transaction with its signatures stripped.
    TransactionId
);
hash_id!(
    /// Identifier of a coin output, live or delayed.
    OutputId
);
hash_id!(
    /// Identifier of a fund-share output.
    FundOutputId
);
hash_id!(
    /// Identifier of a file contract.
    ContractId
);
hash_id!(
    /// Hash of the `UnlockConditions` that may spend an output.
    UnlockHash
);

/// Wrapper around ed25519 public key for spend authorisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify(message, signature)
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(vk: VerifyingKey) -> Self {
        PublicKey(vk)
    }
}

impl From<PublicKey> for VerifyingKey {
    fn from(pk: PublicKey) -> Self {
        pk.0
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.to_bytes().cmp(&other.0.to_bytes())
    }
}

/// Wrapper around a raw ed25519 signature so it can be serialized and
/// deserialized consistently across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(Signature);

impl SignatureBytes {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        SignatureBytes(Signature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl From<Signature> for SignatureBytes {
    fn from(sig: Signature) -> Self {
        SignatureBytes(sig)
    }
}

impl From<SignatureBytes> for Signature {
    fn from(sb: SignatureBytes) -> Self {
        sb.0
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let bytes_array: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))?;
        Ok(SignatureBytes::from_bytes(&bytes_array))
    }
}

/// The conditions under which an output may be spent.
///
/// An output commits only to the hash of its conditions; the spender reveals
/// the full conditions in the input. Conditions with no keys and zero
/// required signatures can be spent by anyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockConditions {
    /// First height at which the output may be spent
    pub timelock: BlockHeight,
    pub public_keys: Vec<PublicKey>,
    pub signatures_required: u64,
}

impl UnlockConditions {
    pub fn anyone_can_spend() -> Self {
        Self::default()
    }

    /// Single-key conditions, the common wallet case.
    pub fn standard(key: PublicKey) -> Self {
        UnlockConditions {
            timelock: 0,
            public_keys: vec![key],
            signatures_required: 1,
        }
    }

    pub fn unlock_hash(&self) -> Result<UnlockHash, CryptoError> {
        hash_encoded(b"unlock conditions", self).map(UnlockHash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinOutput {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinInput {
    pub parent_id: OutputId,
    pub unlock_conditions: UnlockConditions,
}

/// A fund-share output. `claim_start` records the fee pool at creation time
/// and is overwritten by the engine when the output is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundOutput {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
    pub claim_start: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundInput {
    pub parent_id: FundOutputId,
    pub unlock_conditions: UnlockConditions,
    /// Receives the fee-pool claim accumulated by the spent output
    pub claim_unlock_hash: UnlockHash,
}

/// An on-chain storage agreement escrowing `payout` until a storage proof
/// is submitted inside `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContract {
    pub file_size: u64,
    pub file_merkle_root: Hash256,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub payout: Currency,
    pub valid_proof_outputs: Vec<CoinOutput>,
    pub missed_proof_outputs: Vec<CoinOutput>,
    pub unlock_hash: UnlockHash,
    pub revision_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContractRevision {
    pub parent_id: ContractId,
    pub unlock_conditions: UnlockConditions,
    pub new_revision_number: u64,
    pub new_file_size: u64,
    pub new_file_merkle_root: Hash256,
    pub new_window_start: BlockHeight,
    pub new_window_end: BlockHeight,
    pub new_valid_proof_outputs: Vec<CoinOutput>,
    pub new_missed_proof_outputs: Vec<CoinOutput>,
    pub new_unlock_hash: UnlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProof {
    pub parent_id: ContractId,
    pub segment: Vec<u8>,
    pub hash_set: Vec<Hash256>,
}

/// Which set of contract outputs a resolution pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStatus {
    Valid,
    Missed,
}

/// A signature authorising the input whose parent is `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub parent_id: Hash256,
    pub public_key_index: u64,
    pub signature: SignatureBytes,
}

/// A transaction. Every field is a list so one transaction can combine
/// spending, contract formation, revisions, proofs and fund transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub coin_inputs: Vec<CoinInput>,
    pub coin_outputs: Vec<CoinOutput>,
    pub file_contracts: Vec<FileContract>,
    pub file_contract_revisions: Vec<FileContractRevision>,
    pub storage_proofs: Vec<StorageProof>,
    pub fund_inputs: Vec<FundInput>,
    pub fund_outputs: Vec<FundOutput>,
    pub miner_fees: Vec<Currency>,
    pub arbitrary_data: Vec<Vec<u8>>,
    pub signatures: Vec<TransactionSignature>,
}

impl Transaction {
    /// Calculate the transaction identifier.
    ///
    /// The hash covers every field except the signatures, so the id is also
    /// the message each signature signs.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn id(&self) -> Result<TransactionId, CryptoError> {
        let unsigned = (
            &self.coin_inputs,
            &self.coin_outputs,
            &self.file_contracts,
            &self.file_contract_revisions,
            &self.storage_proofs,
            &self.fund_inputs,
            &self.fund_outputs,
            &self.miner_fees,
            &self.arbitrary_data,
        );
        hash_encoded(b"transaction", &unsigned).map(TransactionId)
    }

    pub fn coin_output_id(&self, index: usize) -> Result<OutputId, CryptoError> {
        let id = self.id()?;
        Ok(OutputId(hash_all(&[
            SPECIFIER_COIN_OUTPUT,
            id.as_bytes(),
            &(index as u64).to_le_bytes(),
        ])))
    }

    pub fn file_contract_id(&self, index: usize) -> Result<ContractId, CryptoError> {
        let id = self.id()?;
        Ok(ContractId(hash_all(&[
            SPECIFIER_FILE_CONTRACT,
            id.as_bytes(),
            &(index as u64).to_le_bytes(),
        ])))
    }

    pub fn fund_output_id(&self, index: usize) -> Result<FundOutputId, CryptoError> {
        let id = self.id()?;
        Ok(FundOutputId(hash_all(&[
            SPECIFIER_FUND_OUTPUT,
            id.as_bytes(),
            &(index as u64).to_le_bytes(),
        ])))
    }

    pub fn total_miner_fees(&self) -> Currency {
        self.miner_fees.iter().fold(0, |acc, fee| acc.saturating_add(*fee))
    }

    /// Sign the input whose parent is `parent_id` with the key at
    /// `public_key_index` of that input's unlock conditions.
    ///
    /// All other fields must be final before signing; the signature covers
    /// the transaction id.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if hash calculation fails.
    pub fn sign(
        &mut self,
        parent_id: Hash256,
        public_key_index: u64,
        private_key: &SigningKey,
    ) -> Result<(), CryptoError> {
        let id = self.id()?;
        let signature = private_key.sign(id.as_bytes());
        self.signatures.push(TransactionSignature {
            parent_id,
            public_key_index,
            signature: SignatureBytes::from(signature),
        });
        Ok(())
    }
}

impl ContractId {
    /// Identifier of the `index`th output paid when the contract resolves.
    pub fn storage_proof_output_id(&self, status: ProofStatus, index: usize) -> OutputId {
        let status_byte = match status {
            ProofStatus::Valid => [1u8],
            ProofStatus::Missed => [0u8],
        };
        OutputId(hash_all(&[
            SPECIFIER_STORAGE_PROOF,
            &self.0,
            &status_byte,
            &(index as u64).to_le_bytes(),
        ]))
    }
}

impl FundOutputId {
    /// Identifier of the delayed output paying this output's fee-pool claim.
    pub fn claim_output_id(&self) -> OutputId {
        OutputId(hash_all(&[SPECIFIER_CLAIM_OUTPUT, &self.0]))
    }
}

/// A block in the chain.
///
/// Identity is the content hash returned by [`Block::id`]; a block never
/// changes once constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub parent_id: BlockId,
    /// Proof-of-work nonce
    pub nonce: u64,
    /// Unix timestamp in seconds
    pub timestamp: Timestamp,
    pub miner_payouts: Vec<CoinOutput>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Calculate the SHA-256 identity of the block.
    ///
    /// The header fields are hashed together with a commitment to the
    /// payouts and transactions, so any change to the block changes its id.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn id(&self) -> Result<BlockId, CryptoError> {
        let body = hash_encoded(b"block body", &(&self.miner_payouts, &self.transactions))?;
        Ok(BlockId(hash_all(&[
            self.parent_id.as_bytes(),
            &self.nonce.to_le_bytes(),
            &self.timestamp.to_le_bytes(),
            &body,
        ])))
    }

    pub fn miner_payout_id(&self, index: usize) -> Result<OutputId, CryptoError> {
        let id = self.id()?;
        Ok(OutputId(hash_all(&[
            SPECIFIER_MINER_PAYOUT,
            id.as_bytes(),
            &(index as u64).to_le_bytes(),
        ])))
    }

    /// Size of the canonical encoding, compared against the block size limit.
    pub fn encoded_size(&self) -> Result<u64, CryptoError> {
        bincode::serialized_size(self).map_err(|_| CryptoError::HashConversionError)
    }
}

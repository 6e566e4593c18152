use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use sled::{Db, Tree};
use thiserror::Error;

use crate::types::{Block, BlockHeight, BlockId, CryptoError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Data not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Corrupt key or value under {0}")]
    Corrupt(String),
}

const BLOCK_PREFIX: &str = "block:";
const PATH_PREFIX: &str = "path:";
const DOS_PREFIX: &str = "dos:";

fn block_key(id: &BlockId) -> Vec<u8> {
    format!("{}{}", BLOCK_PREFIX, id).into_bytes()
}

fn path_key(height: BlockHeight) -> Vec<u8> {
    format!("{}{:0>20}", PATH_PREFIX, height).into_bytes()
}

fn dos_key(id: &BlockId) -> Vec<u8> {
    format!("{}{}", DOS_PREFIX, id).into_bytes()
}

fn id_from_slice(bytes: &[u8]) -> Result<BlockId, StorageError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt("block id".into()))?;
    Ok(BlockId::from_bytes(&array))
}

fn id_from_hex_key(key: &[u8], prefix: &str) -> Result<BlockId, StorageError> {
    let hex_part = key
        .strip_prefix(prefix.as_bytes())
        .ok_or_else(|| StorageError::Corrupt(prefix.into()))?;
    let bytes = hex::decode(hex_part).map_err(|_| StorageError::Corrupt(prefix.into()))?;
    id_from_slice(&bytes)
}

/// Key-value store behind the consensus set.
///
/// Implementations supply point lookups, prefix scans and atomic batches;
/// the typed accessors are built on those.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    /// Commit every operation in `batch` or none of them.
    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError>;

    fn get_block(&self, id: &BlockId) -> Result<Option<Block>, StorageError> {
        let encoded = self.get(&block_key(id))?;
        Ok(encoded.map(|e| bincode::deserialize(&e)).transpose()?)
    }

    fn get_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.scan_prefix(BLOCK_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, encoded)| bincode::deserialize(&encoded).map_err(StorageError::from))
            .collect()
    }

    /// The stored current path, genesis first.
    fn get_path(&self) -> Result<Vec<BlockId>, StorageError> {
        self.scan_prefix(PATH_PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, bytes)| id_from_slice(&bytes))
            .collect()
    }

    fn get_dos_blocks(&self) -> Result<Vec<BlockId>, StorageError> {
        self.scan_prefix(DOS_PREFIX.as_bytes())?
            .into_iter()
            .map(|(key, _)| id_from_hex_key(&key, DOS_PREFIX))
            .collect()
    }
}

#[derive(Default)]
pub struct StorageBatch {
    pub ops: Vec<StorageOperation>,
}

pub enum StorageOperation {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl StorageBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn put_block(&mut self, id: &BlockId, block: &Block) -> Result<(), StorageError> {
        self.ops
            .push(StorageOperation::Put(block_key(id), bincode::serialize(block)?));
        Ok(())
    }

    pub fn delete_block(&mut self, id: &BlockId) {
        self.ops.push(StorageOperation::Delete(block_key(id)));
    }

    pub fn set_path(&mut self, height: BlockHeight, id: &BlockId) {
        self.ops
            .push(StorageOperation::Put(path_key(height), id.to_bytes().to_vec()));
    }

    pub fn clear_path(&mut self, height: BlockHeight) {
        self.ops.push(StorageOperation::Delete(path_key(height)));
    }

    pub fn mark_dos(&mut self, id: &BlockId) {
        self.ops.push(StorageOperation::Put(dos_key(id), Vec::new()));
    }
}

pub struct SledStorage {
    db: Db,
    consensus_tree: Tree,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that is deleted when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            consensus_tree: db.open_tree("consensus")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.consensus_tree.get(key)?.map(|value| value.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.consensus_tree.scan_prefix(prefix) {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut tree_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => {
                    tree_batch.insert(key, value);
                }
                StorageOperation::Delete(key) => {
                    tree_batch.remove(key);
                }
            }
        }
        self.consensus_tree.apply_batch(tree_batch)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => {
                    entries.insert(key, value);
                }
                StorageOperation::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

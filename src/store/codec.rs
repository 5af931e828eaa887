use sha2::{Digest, Sha256};

use super::{ChunkCodec, EncodedChunk};
use crate::error::StoreError;
use crate::tree::manifest::{ChunkId, ChunkRef};

/// Default plaintext chunk length (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Splits data into fixed-size pieces and names each by the SHA-256 of its
/// stored bytes. Stored bytes equal plaintext; an encrypting codec plugs in
/// through the same trait.
#[derive(Debug, Clone)]
pub struct Sha256Codec {
    chunk_size: u64,
}

impl Sha256Codec {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for Sha256Codec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkCodec for Sha256Codec {
    fn encode(&self, data: &[u8]) -> Vec<EncodedChunk> {
        data.chunks(self.chunk_size as usize)
            .map(|piece| EncodedChunk {
                id: chunk_id(piece),
                len: piece.len() as u64,
                stored: piece.to_vec(),
            })
            .collect()
    }

    fn decode(&self, chunk: &ChunkRef, stored: &[u8]) -> Result<Vec<u8>, StoreError> {
        if stored.len() as u64 != chunk.len {
            return Err(StoreError::Corrupt(format!(
                "chunk {} is {} bytes, manifest expects {}",
                chunk.id,
                stored.len(),
                chunk.len
            )));
        }
        Ok(stored.to_vec())
    }

    fn verify(&self, id: &ChunkId, stored: &[u8]) -> bool {
        chunk_id(stored) == *id
    }

    fn target_chunk_len(&self) -> u64 {
        self.chunk_size
    }
}

/// SHA-256 content identifier of `data`.
pub fn chunk_id(data: &[u8]) -> ChunkId {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ChunkId::new(hash_hex(&hasher.finalize()))
}

/// Format a hash as a hex string.
pub fn hash_hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

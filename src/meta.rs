use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::piece_store::DEFAULT_PIECE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed metadata record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("hash {0} is not 20 bytes of hex")]
    BadHash(usize),
}

pub type Result<T> = std::result::Result<T, MetaError>;

// On-disk shape: pretty-printed JSON, hashes as hex so the sidecar stays
// human-readable. `length` is informational only (see piece-accounting
// note below) and may over-count the final, possibly-short piece.
#[derive(Debug, Serialize, Deserialize)]
struct RawMeta {
    name: String,
    length: u64,
    piece_size: u32,
    hashes: Vec<String>,
}

/// Persisted description of a shareable file (spec §3/§4.C).
///
/// The info-hash is the SHA-1 of the literal bytes of the persisted
/// record, computed once at construction (`new`) or load (`load`) time
/// and cached — this is what keeps the info-hash stable across a
/// write/load round-trip without requiring a canonical re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub name: String,
    pub length: u64,
    pub piece_size: u32,
    pub hashes: Vec<[u8; 20]>,
    raw: Vec<u8>,
}

impl Meta {
    pub fn new(name: String, piece_size: u32, hashes: Vec<[u8; 20]>) -> Result<Self> {
        let piece_size = if piece_size == 0 { DEFAULT_PIECE_SIZE as u32 } else { piece_size };
        let length = hashes.len() as u64 * piece_size as u64;
        let raw_view = RawMeta {
            name: name.clone(),
            length,
            piece_size,
            hashes: hashes.iter().map(hex::encode).collect(),
        };
        let raw = serde_json::to_vec_pretty(&raw_view)?;
        Ok(Self { name, length, piece_size, hashes, raw })
    }

    /// Writes the record as pretty-printed JSON, mode 0644.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(&path, &self.raw)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o644);
            std::fs::set_permissions(&path, perms)?;
        }
        Ok(())
    }

    /// Parses a sidecar written by `write`, computing the info-hash over
    /// the literal bytes read from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let parsed: RawMeta = serde_json::from_slice(&raw)?;

        let mut hashes = Vec::with_capacity(parsed.hashes.len());
        for (i, h) in parsed.hashes.iter().enumerate() {
            let bytes = hex::decode(h).map_err(|_| MetaError::BadHash(i))?;
            let arr: [u8; 20] = bytes.as_slice().try_into().map_err(|_| MetaError::BadHash(i))?;
            hashes.push(arr);
        }

        Ok(Self {
            name: parsed.name,
            length: parsed.length,
            piece_size: parsed.piece_size,
            hashes,
            raw,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    /// 20-byte SHA-1 of the literal persisted bytes; keys DHT lookups and
    /// the handshake's content identifier.
    pub fn info_hash(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(&self.raw);
        hasher.finalize().into()
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash())
    }

    // The final piece may be shorter than piece_size; `length` above
    // over-counts it, so consumers that need the true byte length of a
    // piece must compute it from the total file size, not from
    // `piece_size * num_pieces`.
    pub fn piece_length(&self, idx: usize, total_len: u64) -> usize {
        let full = self.piece_size as u64;
        let offset = idx as u64 * full;
        full.min(total_len.saturating_sub(offset)) as usize
    }
}

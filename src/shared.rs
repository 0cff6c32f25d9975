use std::sync::Mutex;

use crate::bitfield::Bitfield;

/// State a session controller owns exclusively for the lifetime of a
/// torrent: the piece buffer, the local bitfield, and the info-hash/piece
/// hashes needed to verify arrivals. Peer sessions and the swarm each hold
/// an `Arc` onto this rather than a back-pointer into one another (spec
/// §9's cyclic-ownership note).
pub struct TorrentContext {
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub hashes: Vec<[u8; 20]>,
    pub pieces: Mutex<Vec<Option<Vec<u8>>>>,
    pub bitfield: Mutex<Bitfield>,
}

impl TorrentContext {
    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    pub fn local_bitfield_snapshot(&self) -> Bitfield {
        self.bitfield.lock().unwrap().clone()
    }

    /// True once every piece is present, i.e. the local bitfield is full.
    pub fn is_complete(&self) -> bool {
        self.bitfield.lock().unwrap().all()
    }
}

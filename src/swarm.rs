use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};

use crate::peer::{self, HaveEvent, PeerError, PeerHandle};
use crate::piece_store;
use crate::shared::TorrentContext;
use crate::wire::Message;

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error(transparent)]
    Store(#[from] piece_store::StoreError),
}

const TICK_INTERVAL: Duration = Duration::from_secs(2);

// A request that hasn't resolved (verified arrival, or bad-hash drop)
// within one tick is considered stale and eligible for re-request —
// there's no explicit NAK on the wire, so this is the only way a
// rejected piece gets retried.
const REQUEST_TIMEOUT: Duration = TICK_INTERVAL;

/// Rarest-first piece picker and peer roster. Owns no piece bytes itself
/// — those live behind `ctx.pieces`/`ctx.bitfield`, shared with every peer
/// session — but is the only task that issues Requests and decides when
/// a download is done.
pub struct Swarm {
    ctx: Arc<TorrentContext>,
    out_path: PathBuf,
    peers: Mutex<Vec<PeerHandle>>,
    in_flight: Mutex<HashMap<usize, (SocketAddr, Instant)>>,
    have_tx: mpsc::Sender<HaveEvent>,
    completed_tx: watch::Sender<bool>,
    completed_rx: watch::Receiver<bool>,
}

impl Swarm {
    /// Returns the swarm plus the receiving half of its have-event
    /// channel; pass the receiver to `run` to start the drive loop.
    pub fn new(ctx: Arc<TorrentContext>, out_path: PathBuf) -> (Arc<Self>, mpsc::Receiver<HaveEvent>) {
        let (have_tx, have_rx) = mpsc::channel(32);
        let (completed_tx, completed_rx) = watch::channel(false);
        let swarm = Arc::new(Self {
            ctx,
            out_path,
            peers: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            have_tx,
            completed_tx,
            completed_rx,
        });
        (swarm, have_rx)
    }

    /// A watch receiver that reads `true` once the download has written
    /// its output file, latching past-complete state for any subscriber
    /// that starts watching after completion (unlike a plain `Notify`).
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.completed_rx.clone()
    }

    pub fn have_sender(&self) -> mpsc::Sender<HaveEvent> {
        self.have_tx.clone()
    }

    pub async fn add_peer(&self, handle: PeerHandle) {
        tracing::info!(event = "peer_joined", peer = %handle.address);
        self.peers.lock().await.push(handle);
    }

    /// Dials every address in `addresses` that isn't already connected.
    /// Failed dials are logged and skipped, never fatal to the swarm.
    pub async fn dial_all(&self, addresses: &[SocketAddr]) {
        let already: Vec<SocketAddr> = self.peers.lock().await.iter().map(|p| p.address).collect();
        for &address in addresses {
            if already.contains(&address) {
                continue;
            }
            match peer::dial(address, self.ctx.clone(), self.have_tx.clone()).await {
                Ok(handle) => self.add_peer(handle).await,
                Err(PeerError::ConnectTimeout(_)) => {
                    tracing::debug!(event = "dial_timeout", peer = %address);
                }
                Err(err) => {
                    tracing::debug!(event = "dial_failed", peer = %address, error = %err);
                }
            }
        }
    }

    async fn availability(&self) -> Vec<usize> {
        let peers = self.peers.lock().await;
        let mut counts = vec![0usize; self.ctx.num_pieces()];
        for peer in peers.iter() {
            let bf = peer.remote_bitfield.read().await;
            for idx in 0..counts.len() {
                if bf.has(idx) {
                    counts[idx] += 1;
                }
            }
        }
        counts
    }

    fn missing_indices(&self) -> Vec<usize> {
        let bf = self.ctx.bitfield.lock().unwrap();
        (0..bf.len()).filter(|&i| !bf.has(i)).collect()
    }

    /// Rarest-first: among missing pieces not already in flight, the one
    /// held by the fewest peers, ties broken by lowest index.
    async fn choose_piece(&self) -> Option<usize> {
        let missing = self.missing_indices();
        if missing.is_empty() {
            return None;
        }

        let availability = self.availability().await;
        let in_flight = self.in_flight.lock().await;
        let now = Instant::now();

        missing
            .into_iter()
            .filter(|idx| {
                let fresh = in_flight.get(idx).is_some_and(|(_, at)| now.duration_since(*at) < REQUEST_TIMEOUT);
                !fresh && availability[*idx] > 0
            })
            .min_by_key(|idx| availability[*idx])
    }

    /// Among peers advertising `idx`, request it from one chosen uniformly
    /// at random — spreads load and avoids head-of-line stalls on a slow
    /// peer, rather than always hammering the first match.
    async fn request(&self, idx: usize) {
        let peers = self.peers.lock().await;
        let mut holders = Vec::new();
        for p in peers.iter() {
            if p.remote_bitfield.read().await.has(idx) {
                holders.push(p.address);
            }
        }
        if holders.is_empty() {
            return;
        }
        let peer_addr = holders[rand::random::<usize>() % holders.len()];
        let Some(p) = peers.iter().find(|p| p.address == peer_addr) else { return };
        if p.outbound.send(Message::Request { piece_idx: idx as u32, offset: 0 }).await.is_ok() {
            drop(peers);
            self.in_flight.lock().await.insert(idx, (peer_addr, Instant::now()));
        }
    }

    async fn broadcast_have(&self, idx: usize, except: SocketAddr) {
        let peers = self.peers.lock().await;
        for p in peers.iter().filter(|p| p.address != except) {
            let _ = p.outbound.send(Message::Have { piece_idx: idx as u32 }).await;
        }
    }

    async fn reap(&self, address: SocketAddr) {
        let mut peers = self.peers.lock().await;
        if let Some(pos) = peers.iter().position(|p| p.address == address) {
            let handle = peers.remove(pos);
            handle.abort();
        }
        drop(peers);
        self.in_flight.lock().await.retain(|_, (addr, _)| *addr != address);
        tracing::info!(event = "peer_departed", peer = %address);
    }

    async fn join_to_disk(&self) -> Result<(), SwarmError> {
        let pieces = self.ctx.pieces.lock().unwrap().clone();
        piece_store::join(&pieces, &self.out_path)?;
        tracing::info!(event = "download_complete", path = %self.out_path.display());
        Ok(())
    }

    /// Drives the download end to end: a 2s ticker issues one new request
    /// per tick while pieces remain missing, and `HaveEvent`s from peer
    /// sessions update the in-flight table, broadcast freshly-owned
    /// pieces, and reap departed peers. Runs indefinitely once complete
    /// so the swarm keeps serving uploads and accepting new peers.
    pub async fn run(self: Arc<Self>, mut have_rx: mpsc::Receiver<HaveEvent>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let mut already_complete = self.ctx.is_complete();
        if already_complete {
            // Covers the zero-piece payload: nothing will ever arrive over
            // `have_rx` to trigger the write, so do it once up front.
            if let Err(err) = self.join_to_disk().await {
                tracing::error!(event = "join_failed", error = %err);
            }
            let _ = self.completed_tx.send(true);
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !already_complete {
                        if let Some(idx) = self.choose_piece().await {
                            self.request(idx).await;
                        }
                    }
                }
                event = have_rx.recv() => {
                    match event {
                        Some(HaveEvent::PieceOwned { source, piece_idx }) => {
                            self.in_flight.lock().await.remove(&piece_idx);
                            self.broadcast_have(piece_idx, source).await;
                            if !already_complete && self.ctx.is_complete() {
                                already_complete = true;
                                if let Err(err) = self.join_to_disk().await {
                                    tracing::error!(event = "join_failed", error = %err);
                                }
                                let _ = self.completed_tx.send(true);
                            } else if !already_complete {
                                if let Some(idx) = self.choose_piece().await {
                                    self.request(idx).await;
                                }
                            }
                        }
                        Some(HaveEvent::Departed { peer }) => {
                            self.reap(peer).await;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

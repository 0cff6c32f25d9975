mod msg;
mod table;

pub use msg::{Msg, MsgKind, MsgPeer};
pub use table::{Peer, Table, K};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};

const INBOX_CAPACITY: usize = 32;
const INBOX_PEERS_CAPACITY: usize = 8;
const MAX_DATAGRAM: usize = 1024;
const FIND_PEERS_TIMEOUT: Duration = Duration::from_millis(500);
const PING_REPLY_PEERS: usize = 5;

const LOOKUP_ALPHA: usize = 3;
const LOOKUP_MAX_ROUNDS: usize = 3;
const LOOKUP_MAX_PEERS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;

struct Packet {
    msg: Msg,
    src: SocketAddr,
}

/// `info_hash hex -> ordered, deduplicated tcp contacts`. Touched only
/// from the dispatcher task (spec §5: "single-writer, so it requires no
/// lock"), but we still wrap it in a `Mutex` since `ping`/`find_peers`
/// handlers and the dispatcher all run as async tasks sharing this `Arc`.
type AnnounceStore = HashMap<String, Vec<String>>;

/// One DHT node per process: random 20-byte id, UDP socket, routing
/// table, announce store. A reader task decodes datagrams into `inbox`;
/// a dispatcher task drains `inbox`, routing `peers` replies into
/// `inbox_peers` (so `find_peers`'s blocking wait can't starve ordinary
/// dispatch) and handling everything else inline.
pub struct DhtNode {
    pub id: [u8; 20],
    socket: Arc<UdpSocket>,
    pub table: Arc<RwLock<Table>>,
    seeds: Mutex<AnnounceStore>,
    inbox_peers_tx: mpsc::Sender<Packet>,
    inbox_peers_rx: Mutex<mpsc::Receiver<Packet>>,
}

impl DhtNode {
    /// Binds `listen`, generates a uniformly random node id, and spawns
    /// the reader and dispatcher tasks.
    pub async fn bind(listen: SocketAddr) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        let id = random_node_id();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (inbox_peers_tx, inbox_peers_rx) = mpsc::channel(INBOX_PEERS_CAPACITY);

        let node = Arc::new(Self {
            id,
            socket: socket.clone(),
            table: Arc::new(RwLock::new(Table::new(id))),
            seeds: Mutex::new(HashMap::new()),
            inbox_peers_tx,
            inbox_peers_rx: Mutex::new(inbox_peers_rx),
        });

        tracing::info!(event = "dht_started_listening", addr = %node.local_addr());
        tokio::spawn(Self::reader_loop(socket, inbox_tx));
        tokio::spawn(Self::dispatch_loop(node.clone(), inbox_rx));
        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("bound socket has a local address")
    }

    async fn reader_loop(socket: Arc<UdpSocket>, inbox_tx: mpsc::Sender<Packet>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, src)) => match serde_json::from_slice::<Msg>(&buf[..n]) {
                    Ok(msg) => {
                        let _ = inbox_tx.send(Packet { msg, src }).await;
                    }
                    Err(err) => {
                        tracing::debug!(event = "dht_decode_error", peer = %src, error = %err);
                    }
                },
                Err(err) => {
                    tracing::warn!(event = "dht_recv_error", error = %err);
                }
            }
        }
    }

    async fn dispatch_loop(node: Arc<Self>, mut inbox_rx: mpsc::Receiver<Packet>) {
        while let Some(packet) = inbox_rx.recv().await {
            if packet.msg.t == MsgKind::Peers {
                let _ = node.inbox_peers_tx.send(packet).await;
            } else {
                node.handle(packet.msg, packet.src).await;
            }
        }
    }

    /// Refreshes the routing table with the sender, then dispatches by
    /// kind (spec §4.H). Never invoked directly for `peers` replies —
    /// those are routed to `inbox_peers` by the dispatcher.
    async fn handle(&self, msg: Msg, src: SocketAddr) {
        if let Some(sender_id) = decode_node_id(&msg.id) {
            self.table.write().await.update(Peer { id: sender_id, addr: src, last_seen: Instant::now() });
        }

        match msg.t {
            MsgKind::Ping => {
                let known = self.table.read().await.sample(PING_REPLY_PEERS);
                let dht_peers = known
                    .iter()
                    .map(|p| MsgPeer { id: hex::encode(p.id), addr: p.addr.to_string() })
                    .collect();
                self.send(src, Msg::pong(self.id, dht_peers)).await;
            }
            MsgKind::Pong => {
                for p in msg.dht_peers.into_iter().flatten() {
                    match (decode_node_id(&p.id), p.addr.parse::<SocketAddr>()) {
                        (Some(id), Ok(addr)) => {
                            self.table.write().await.update(Peer { id, addr, last_seen: Instant::now() });
                        }
                        _ => {
                            tracing::debug!(event = "dht_lookup_bad_address", addr = %p.addr);
                        }
                    }
                }
            }
            MsgKind::Announce => {
                if let (Some(info), Some(addr)) = (msg.info, msg.addr) {
                    if !addr.is_empty() {
                        let mut seeds = self.seeds.lock().await;
                        let contacts = seeds.entry(info).or_default();
                        if !contacts.contains(&addr) {
                            contacts.push(addr);
                        }
                    }
                }
            }
            MsgKind::FindPeers => {
                if let Some(info) = msg.info {
                    let list = self.seeds.lock().await.get(&info).cloned().unwrap_or_default();
                    self.send(src, Msg::peers(self.id, info, list)).await;
                }
            }
            MsgKind::Peers => unreachable!("routed to inbox_peers before handle is called"),
        }
    }

    async fn send(&self, dst: SocketAddr, msg: Msg) {
        match serde_json::to_vec(&msg) {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, dst).await {
                    tracing::warn!(event = "dht_send_error", peer = %dst, error = %err);
                }
            }
            Err(err) => tracing::warn!(event = "dht_encode_error", error = %err),
        }
    }

    /// Sends a `ping`, expecting an asynchronous `pong` (handled above).
    pub async fn ping(&self, addr: SocketAddr) {
        self.send(addr, Msg::ping(self.id)).await;
    }

    /// Tells every contact currently in the routing table "I serve
    /// `info_hash_hex` and you can fetch it from `tcp_addr`".
    pub async fn announce(&self, info_hash_hex: &str, tcp_addr: &str) {
        let contacts = self.table.read().await.addresses();
        for addr in contacts {
            self.send(addr, Msg::announce(self.id, info_hash_hex.to_string(), tcp_addr.to_string())).await;
        }
    }

    /// Sends one `findPeers` to `bootstrap` and waits up to 500ms for a
    /// `peers` reply, returning its `tcp_list` (empty on timeout).
    /// Non-`peers` traffic never reaches `inbox_peers`, so every message
    /// read here is a candidate reply.
    pub async fn find_peers(&self, bootstrap: SocketAddr, info_hash_hex: &str) -> Vec<String> {
        self.send(bootstrap, Msg::find_peers(self.id, info_hash_hex.to_string())).await;

        let mut inbox_peers = self.inbox_peers_rx.lock().await;
        let sleep = tokio::time::sleep(FIND_PEERS_TIMEOUT);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                packet = inbox_peers.recv() => {
                    match packet {
                        Some(packet) => return packet.msg.tcp_list.unwrap_or_default(),
                        None => return Vec::new(),
                    }
                }
                _ = &mut sleep => {
                    tracing::debug!(event = "dht_lookup_timeout", bootstrap = %bootstrap);
                    return Vec::new();
                }
            }
        }
    }

    /// Iterative-widening lookup (spec §4.H/§4.I): seed a work queue with
    /// the `α` routing-table entries closest to `info_hash`, pop one
    /// contact per round for up to `maxRounds` rounds, union replies into
    /// a set, stop early once the set reaches `maxPeers`.
    pub async fn lookup_peers(&self, info_hash: [u8; 20]) -> Vec<String> {
        let info_hex = hex::encode(info_hash);
        let mut queue = self.table.read().await.closest(info_hash, LOOKUP_ALPHA);
        let mut seen: HashSet<String> = HashSet::new();

        for _ in 0..LOOKUP_MAX_ROUNDS {
            if queue.is_empty() || seen.len() >= LOOKUP_MAX_PEERS {
                break;
            }
            let target = queue.remove(0);
            let reply = self.find_peers(target.addr, &info_hex).await;
            tracing::debug!(event = "dht_lookup_reply", from = %target.addr, count = reply.len());
            seen.extend(reply);
        }

        seen.into_iter().collect()
    }
}

fn random_node_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn decode_node_id(hex_id: &str) -> Option<[u8; 20]> {
    let raw = hex::decode(hex_id).ok()?;
    raw.as_slice().try_into().ok()
}

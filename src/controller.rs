use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::dht::{DhtError, DhtNode};
use crate::meta::{Meta, MetaError};
use crate::peer;
use crate::piece_store::{self, StoreError};
use crate::shared::TorrentContext;
use crate::swarm::{Swarm, SwarmError};
use crate::Bitfield;

const ANNOUNCE_MAX_ATTEMPTS: u32 = 5;
const ANNOUNCE_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const LOOKUP_MAX_ATTEMPTS: u32 = 100;
const LOOKUP_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("at most one of --seed/--get may be set")]
    BothRolesSet,

    #[error("invalid network address {0:?}: {1}")]
    BadAddress(String, #[source] std::net::AddrParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error(transparent)]
    Dht(#[from] DhtError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Owns nothing itself (spec §4.I): dispatches to the seeder, leecher, or
/// pure-DHT role based on `cfg`, wiring the metadata/piece-store/swarm/DHT
/// components together for the duration of that role.
pub async fn run(cfg: Config) -> Result<()> {
    match (&cfg.seed, &cfg.get) {
        (Some(_), Some(_)) => Err(ControllerError::BothRolesSet),
        (Some(path), None) => run_seeder(&cfg, path.clone()).await,
        (None, Some(path)) => run_leecher(&cfg, path.clone()).await,
        (None, None) => run_dht_only(&cfg).await,
    }
}

fn random_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Accepts "HOST:PORT" or a bare ":PORT" (all interfaces), matching the
/// Go-style listen addresses in spec.md §6's flag defaults.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let owned;
    let full = if let Some(stripped) = raw.strip_prefix(':') {
        owned = format!("0.0.0.0:{stripped}");
        owned.as_str()
    } else {
        raw
    };
    full.parse().map_err(|e| ControllerError::BadAddress(raw.to_string(), e))
}

/// Splits a comma-separated contact list, trims whitespace, drops empty
/// entries, and logs (without failing) any entry that doesn't parse.
fn parse_contacts(csv: &str) -> Vec<SocketAddr> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(err) => {
                tracing::warn!(event = "bad_contact", contact = s, error = %err);
                None
            }
        })
        .collect()
}

async fn start_dht(dht_listen: &str, bootstrap_csv: &str) -> Result<Option<Arc<DhtNode>>> {
    if dht_listen.is_empty() {
        tracing::info!(event = "dht_disabled");
        return Ok(None);
    }

    let listen = parse_listen_addr(dht_listen)?;
    let node = DhtNode::bind(listen).await?;

    for addr in parse_contacts(bootstrap_csv) {
        node.ping(addr).await;
    }

    Ok(Some(node))
}

/// Loads an existing sidecar or splits `payload` into pieces and writes a
/// fresh one next to it (spec §4.I seeder role, step 1).
fn load_or_create_meta(payload: &Path) -> Result<Meta> {
    let meta_path = sidecar_path(payload);
    if meta_path.exists() {
        return Ok(Meta::load(&meta_path)?);
    }

    let name = payload
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| payload.to_string_lossy().into_owned());
    let (_pieces, hashes) = piece_store::split(payload, piece_store::DEFAULT_PIECE_SIZE)?;
    let meta = Meta::new(name, piece_store::DEFAULT_PIECE_SIZE as u32, hashes)?;
    meta.write(&meta_path)?;
    tracing::info!(event = "meta_write", file = %meta_path.display());
    Ok(meta)
}

pub fn sidecar_path(payload: &Path) -> PathBuf {
    let mut os = payload.as_os_str().to_owned();
    os.push(".bit");
    PathBuf::from(os)
}

fn full_context(meta: &Meta, pieces: Vec<Vec<u8>>) -> Arc<TorrentContext> {
    let mut bf = Bitfield::new(meta.num_pieces());
    for i in 0..meta.num_pieces() {
        bf.set(i);
    }

    Arc::new(TorrentContext {
        info_hash: meta.info_hash(),
        local_peer_id: random_peer_id(),
        hashes: meta.hashes.clone(),
        pieces: Mutex::new(pieces.into_iter().map(Some).collect()),
        bitfield: Mutex::new(bf),
    })
}

fn empty_context(meta: &Meta) -> Arc<TorrentContext> {
    Arc::new(TorrentContext {
        info_hash: meta.info_hash(),
        local_peer_id: random_peer_id(),
        hashes: meta.hashes.clone(),
        pieces: Mutex::new(vec![None; meta.num_pieces()]),
        bitfield: Mutex::new(Bitfield::new(meta.num_pieces())),
    })
}

/// Seeder role (spec §4.I): ensure metadata, populate a full piece
/// buffer, optionally announce to the DHT, then accept TCP connections
/// forever, handing each off to its own peer session.
async fn run_seeder(cfg: &Config, payload: PathBuf) -> Result<()> {
    let meta = load_or_create_meta(&payload)?;
    let (pieces, _hashes) = piece_store::split(&payload, meta.piece_size as usize)?;
    let ctx = full_context(&meta, pieces);

    let listen_addr = parse_listen_addr(&cfg.addr)?;
    let dht = start_dht(&cfg.dht_listen, &cfg.bootstrap).await?;

    if let Some(dht) = dht.clone() {
        let info_hash_hex = meta.info_hash_hex();
        let tcp_addr = listen_addr.to_string();
        tokio::spawn(async move {
            for attempt in 0..ANNOUNCE_MAX_ATTEMPTS {
                if !dht.table.read().await.addresses().is_empty() {
                    dht.announce(&info_hash_hex, &tcp_addr).await;
                    tracing::info!(event = "dht_announce", info_hash = %info_hash_hex);
                    return;
                }
                if attempt + 1 < ANNOUNCE_MAX_ATTEMPTS {
                    tokio::time::sleep(ANNOUNCE_RETRY_INTERVAL).await;
                }
            }
            tracing::warn!(event = "dht_announce_no_contacts");
        });
    }

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(event = "seeder_listening", addr = %listen_addr);

    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                let ctx = ctx.clone();
                // Seeder sessions never have missing pieces to request, so
                // their Have/Departed events have no consumer; a one-slot
                // channel whose receiver is dropped immediately lets the
                // session's sends fail silently rather than block.
                let (have_tx, _have_rx) = tokio::sync::mpsc::channel(1);
                tokio::spawn(async move {
                    let _handle = peer::accept(address, stream, ctx, have_tx).await;
                });
            }
            Err(err) => {
                tracing::warn!(event = "accept_err", error = %err);
            }
        }
    }
}

/// Leecher role (spec §4.I): load metadata, discover peers (DHT lookup
/// merged with the static `--peer` CSV), run the swarm to completion,
/// then optionally keep seeding for `--keep` seconds.
async fn run_leecher(cfg: &Config, meta_path: PathBuf) -> Result<()> {
    let meta = Meta::load(&meta_path)?;
    let ctx = empty_context(&meta);

    let dht = start_dht(&cfg.dht_listen, &cfg.bootstrap).await?;
    let mut contacts = parse_contacts(&cfg.peer);

    if let Some(dht) = &dht {
        let mut found = Vec::new();
        for attempt in 0..LOOKUP_MAX_ATTEMPTS {
            found = dht.lookup_peers(meta.info_hash()).await;
            if !found.is_empty() {
                break;
            }
            if attempt + 1 < LOOKUP_MAX_ATTEMPTS {
                tokio::time::sleep(LOOKUP_RETRY_INTERVAL).await;
            }
        }
        for addr in found {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => contacts.push(addr),
                Err(err) => tracing::warn!(event = "bad_contact", contact = addr, error = %err),
            }
        }
    }

    let out_path = cfg.dest.join(&meta.name);
    let (swarm, have_rx) = Swarm::new(ctx.clone(), out_path);
    let have_tx = swarm.have_sender();

    for &address in &contacts {
        match peer::dial(address, ctx.clone(), have_tx.clone()).await {
            Ok(handle) => swarm.add_peer(handle).await,
            Err(err) => tracing::debug!(event = "dial_failed", peer = %address, error = %err),
        }
    }

    let mut completed = swarm.completed();
    let swarm_task = tokio::spawn(swarm.clone().run(have_rx));
    while !*completed.borrow() {
        if completed.changed().await.is_err() {
            break;
        }
    }

    if cfg.keep > 0 {
        seed_lite(cfg, ctx).await?;
    }

    swarm_task.abort();
    Ok(())
}

/// Post-completion phase: accept new TCP connections serving the now-full
/// piece buffer until `keep` seconds elapse, then stop (dropping the
/// listener is the cancellation primitive, per spec §5).
async fn seed_lite(cfg: &Config, ctx: Arc<TorrentContext>) -> Result<()> {
    let listen_addr = parse_listen_addr(&cfg.addr)?;
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(event = "keep_seeding", addr = %listen_addr, seconds = cfg.keep);

    let deadline = tokio::time::sleep(Duration::from_secs(cfg.keep));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, address)) => {
                        let ctx = ctx.clone();
                        let (have_tx, _have_rx) = tokio::sync::mpsc::channel(1);
                        tokio::spawn(async move {
                            let _handle = peer::accept(address, stream, ctx, have_tx).await;
                        });
                    }
                    Err(err) => tracing::warn!(event = "accept_err", error = %err),
                }
            }
            _ = &mut deadline => {
                tracing::info!(event = "keep_seeding_done");
                return Ok(());
            }
        }
    }
}

/// Pure DHT-node role: bind the node, ping the bootstrap list, and park.
async fn run_dht_only(cfg: &Config) -> Result<()> {
    let _dht = start_dht(&cfg.dht_listen, &cfg.bootstrap).await?;
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_addr_accepts_bare_port() {
        let addr = parse_listen_addr(":6881").unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:6881");
    }

    #[test]
    fn parse_listen_addr_accepts_full_address() {
        let addr = parse_listen_addr("127.0.0.1:6881").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn parse_contacts_trims_and_drops_empty() {
        let contacts = parse_contacts(" 127.0.0.1:1 , ,127.0.0.1:2,");
        assert_eq!(contacts.len(), 2);
    }

    #[test]
    fn parse_contacts_skips_bad_entries_without_failing() {
        let contacts = parse_contacts("not-an-addr,127.0.0.1:1");
        assert_eq!(contacts.len(), 1);
    }

    #[test]
    fn sidecar_path_appends_bit_extension() {
        assert_eq!(sidecar_path(Path::new("payload.bin")), PathBuf::from("payload.bin.bit"));
    }
}

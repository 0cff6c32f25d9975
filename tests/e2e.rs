//! End-to-end scenarios that need a real loopback socket between two
//! independently-constructed sides (seeder/leecher), rather than calling
//! into a single module's internals directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use bit_swarm::bitfield::Bitfield;
use bit_swarm::meta::Meta;
use bit_swarm::peer;
use bit_swarm::piece_store;
use bit_swarm::shared::TorrentContext;
use bit_swarm::swarm::Swarm;

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn seeder_context(meta: &Meta, pieces: Vec<Vec<u8>>) -> Arc<TorrentContext> {
    let mut bf = Bitfield::new(meta.num_pieces());
    for i in 0..meta.num_pieces() {
        bf.set(i);
    }
    Arc::new(TorrentContext {
        info_hash: meta.info_hash(),
        local_peer_id: [7u8; 20],
        hashes: meta.hashes.clone(),
        pieces: Mutex::new(pieces.into_iter().map(Some).collect()),
        bitfield: Mutex::new(bf),
    })
}

fn leecher_context(meta: &Meta) -> Arc<TorrentContext> {
    Arc::new(TorrentContext {
        info_hash: meta.info_hash(),
        local_peer_id: [9u8; 20],
        hashes: meta.hashes.clone(),
        pieces: Mutex::new(vec![None; meta.num_pieces()]),
        bitfield: Mutex::new(Bitfield::new(meta.num_pieces())),
    })
}

/// Spawns an accept loop that hands every incoming connection to a peer
/// session sharing `ctx`; returns the address it's listening on.
async fn spawn_seeder(ctx: Arc<TorrentContext>) -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else { return };
            let ctx = ctx.clone();
            let (have_tx, _have_rx) = mpsc::channel(1);
            tokio::spawn(async move {
                let _handle = peer::accept(peer_addr, stream, ctx, have_tx).await;
            });
        }
    });
    addr
}

// S1: a seeder holding a 1000-byte file of 'A' (pieces 256,256,256,232)
// serves a single leecher over loopback TCP; the reconstructed file must
// equal the original byte-for-byte.
#[tokio::test]
async fn round_trip_single_peer_reconstructs_file_byte_for_byte() {
    let dir = tempdir().unwrap();
    let payload_path = dir.path().join("sample.txt");
    let payload = vec![b'A'; 1000];
    std::fs::write(&payload_path, &payload).unwrap();

    let (pieces, hashes) = piece_store::split(&payload_path, 256).unwrap();
    assert_eq!(pieces.iter().map(Vec::len).collect::<Vec<_>>(), vec![256, 256, 256, 232]);

    let meta = Meta::new("sample.txt".into(), 256, hashes).unwrap();
    let seeder_ctx = seeder_context(&meta, pieces);
    let seeder_addr = spawn_seeder(seeder_ctx).await;

    let leecher_ctx = leecher_context(&meta);
    let dest_dir = dir.path().join("dest");
    std::fs::create_dir_all(&dest_dir).unwrap();
    let out_path = dest_dir.join(&meta.name);

    let (swarm, have_rx) = Swarm::new(leecher_ctx.clone(), out_path.clone());
    let have_tx = swarm.have_sender();
    let handle = peer::dial(seeder_addr, leecher_ctx, have_tx).await.unwrap();
    swarm.add_peer(handle).await;

    let mut completed = swarm.completed();
    tokio::spawn(swarm.run(have_rx));

    tokio::time::timeout(Duration::from_secs(10), async {
        while !*completed.borrow() {
            completed.changed().await.unwrap();
        }
    })
    .await
    .expect("download did not complete in time");

    let reconstructed = std::fs::read(&out_path).unwrap();
    assert_eq!(reconstructed, payload);
}

// S2: a leecher dials a seeder serving different content (different
// info-hash). The handshake mismatch drops the connection before any
// piece ever moves, so the leecher never completes and writes nothing.
#[tokio::test]
async fn infohash_mismatch_drops_connection_without_writing_output() {
    let dir = tempdir().unwrap();

    let wrong_path = dir.path().join("other.txt");
    std::fs::write(&wrong_path, vec![b'B'; 300]).unwrap();
    let (wrong_pieces, wrong_hashes) = piece_store::split(&wrong_path, 256).unwrap();
    let wrong_meta = Meta::new("other.txt".into(), 256, wrong_hashes).unwrap();
    let seeder_ctx = seeder_context(&wrong_meta, wrong_pieces);
    let seeder_addr = spawn_seeder(seeder_ctx).await;

    let expected_path = dir.path().join("sample.txt");
    std::fs::write(&expected_path, vec![b'A'; 300]).unwrap();
    let (_pieces, expected_hashes) = piece_store::split(&expected_path, 256).unwrap();
    let expected_meta = Meta::new("sample.txt".into(), 256, expected_hashes).unwrap();
    let leecher_ctx = leecher_context(&expected_meta);

    let out_path = dir.path().join("dest").join(&expected_meta.name);
    let (swarm, have_rx) = Swarm::new(leecher_ctx.clone(), out_path.clone());
    let have_tx = swarm.have_sender();
    let handle = peer::dial(seeder_addr, leecher_ctx, have_tx).await.unwrap();
    swarm.add_peer(handle).await;

    let mut completed = swarm.completed();
    tokio::spawn(swarm.run(have_rx));

    let result = tokio::time::timeout(Duration::from_millis(500), async {
        while !*completed.borrow() {
            completed.changed().await.unwrap();
        }
    })
    .await;

    assert!(result.is_err(), "leecher should never complete against a mismatched seeder");
    assert!(!out_path.exists());
}

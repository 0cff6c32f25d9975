use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;

use crate::bitfield::Bitfield;
use crate::shared::TorrentContext;
use crate::wire::{Message, MessageCodec};

use super::{HaveEvent, PeerHandle, OUTBOUND_QUEUE_CAPACITY};

type Sink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type Stream = SplitStream<Framed<TcpStream, MessageCodec>>;

/// Spawns the writer and reader tasks for a freshly-connected socket,
/// sends the opening Handshake + Bitfield (the NEW -> AWAIT_HS
/// transition), and returns a handle the swarm can enqueue requests on.
pub(super) async fn spawn(
    address: SocketAddr,
    stream: TcpStream,
    ctx: Arc<TorrentContext>,
    have_tx: mpsc::Sender<HaveEvent>,
) -> PeerHandle {
    let framed = Framed::new(stream, MessageCodec);
    let (sink, stream) = framed.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let remote_bitfield = Arc::new(RwLock::new(Bitfield::new(ctx.num_pieces())));

    let writer_task = tokio::spawn(writer_loop(sink, outbound_rx, address));

    let handshake = Message::Handshake { info_hash: ctx.info_hash, peer_id: ctx.local_peer_id };
    let bitfield = Message::Bitfield(ctx.local_bitfield_snapshot().serialize());
    let _ = outbound_tx.send(handshake).await;
    let _ = outbound_tx.send(bitfield).await;

    let reader_task = tokio::spawn(reader_loop(
        stream,
        ctx,
        address,
        remote_bitfield.clone(),
        outbound_tx.clone(),
        have_tx,
    ));

    PeerHandle { address, outbound: outbound_tx, remote_bitfield, reader_task, writer_task }
}

async fn writer_loop(mut sink: Sink, mut rx: mpsc::Receiver<Message>, address: SocketAddr) {
    while let Some(msg) = rx.recv().await {
        if let Err(err) = sink.send(msg).await {
            tracing::warn!(event = "peer_write_failed", peer = %address, error = %err);
            return;
        }
    }
}

async fn reader_loop(
    mut stream: Stream,
    ctx: Arc<TorrentContext>,
    address: SocketAddr,
    remote_bitfield: Arc<RwLock<Bitfield>>,
    outbound: mpsc::Sender<Message>,
    have_tx: mpsc::Sender<HaveEvent>,
) {
    match stream.next().await {
        Some(Ok(Message::Handshake { info_hash, .. })) => {
            if info_hash != ctx.info_hash {
                tracing::warn!(event = "infohash_mismatch", peer = %address);
                return;
            }
            tracing::debug!(event = "handshake_ok", peer = %address);
        }
        Some(Ok(other)) => {
            tracing::warn!(event = "protocol_violation", peer = %address, got = %other, "expected handshake first");
            return;
        }
        Some(Err(err)) => {
            tracing::warn!(event = "transient_io", peer = %address, error = %err);
            return;
        }
        None => {
            tracing::debug!(event = "peer_closed_before_handshake", peer = %address);
            return;
        }
    }

    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                dispatch(msg, &ctx, address, &remote_bitfield, &outbound, &have_tx).await;
            }
            Some(Err(err)) => {
                tracing::warn!(event = "transient_io", peer = %address, error = %err);
                break;
            }
            None => {
                tracing::debug!(event = "peer_eof", peer = %address);
                break;
            }
        }
    }

    let _ = have_tx.send(HaveEvent::Departed { peer: address }).await;
}

async fn dispatch(
    msg: Message,
    ctx: &Arc<TorrentContext>,
    address: SocketAddr,
    remote_bitfield: &Arc<RwLock<Bitfield>>,
    outbound: &mpsc::Sender<Message>,
    have_tx: &mpsc::Sender<HaveEvent>,
) {
    match msg {
        Message::Handshake { .. } => {
            tracing::debug!(event = "duplicate_handshake", peer = %address);
        }
        Message::Bitfield(bytes) => {
            let mut bf = remote_bitfield.write().await;
            *bf = Bitfield::parse(&bytes);
        }
        Message::Have { piece_idx } => {
            let idx = piece_idx as usize;
            if idx < ctx.num_pieces() {
                remote_bitfield.write().await.set(idx);
            }
        }
        Message::Request { piece_idx, .. } => {
            let idx = piece_idx as usize;
            let data = { ctx.pieces.lock().unwrap().get(idx).and_then(|p| p.clone()) };
            if let Some(data) = data {
                let _ = outbound.send(Message::Piece { piece_idx, offset: 0, data }).await;
            }
        }
        Message::Piece { piece_idx, data, .. } => {
            let idx = piece_idx as usize;
            if idx >= ctx.num_pieces() {
                tracing::warn!(event = "protocol_violation", peer = %address, piece_idx, "index out of range");
                return;
            }

            if ctx.bitfield.lock().unwrap().has(idx) {
                tracing::debug!(event = "duplicate_piece", peer = %address, piece_idx);
                return;
            }

            let mut hasher = Sha1::new();
            hasher.update(&data);
            let digest: [u8; 20] = hasher.finalize().into();
            if digest != ctx.hashes[idx] {
                tracing::warn!(event = "bad_piece_hash", peer = %address, piece_idx);
                return;
            }

            {
                let mut pieces = ctx.pieces.lock().unwrap();
                pieces[idx] = Some(data);
            }
            {
                let mut bf = ctx.bitfield.lock().unwrap();
                bf.set(idx);
            }
            tracing::info!(event = "piece_verified", peer = %address, piece_idx);

            let _ = outbound.send(Message::Have { piece_idx }).await;
            let _ = have_tx.send(HaveEvent::PieceOwned { source: address, piece_idx: idx }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::bitfield::Bitfield;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)
    }

    fn ctx_with_one_piece(good_data: &[u8]) -> Arc<TorrentContext> {
        let mut hasher = Sha1::new();
        hasher.update(good_data);
        let digest: [u8; 20] = hasher.finalize().into();
        Arc::new(TorrentContext {
            info_hash: [0u8; 20],
            local_peer_id: [1u8; 20],
            hashes: vec![digest],
            pieces: Mutex::new(vec![None]),
            bitfield: Mutex::new(Bitfield::new(1)),
        })
    }

    #[tokio::test]
    async fn corrupted_piece_is_discarded_and_never_broadcast() {
        let ctx = ctx_with_one_piece(b"the real bytes");
        let remote_bf = Arc::new(RwLock::new(Bitfield::new(1)));
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let (have_tx, mut have_rx) = mpsc::channel(4);

        dispatch(
            Message::Piece { piece_idx: 0, offset: 0, data: b"tampered bytes!".to_vec() },
            &ctx,
            addr(),
            &remote_bf,
            &outbound_tx,
            &have_tx,
        )
        .await;

        assert!(ctx.pieces.lock().unwrap()[0].is_none());
        assert!(!ctx.bitfield.lock().unwrap().has(0));
        assert!(outbound_rx.try_recv().is_err());
        assert!(have_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn verified_piece_is_stored_and_acked_to_sender() {
        let data = b"the real bytes".to_vec();
        let ctx = ctx_with_one_piece(&data);
        let remote_bf = Arc::new(RwLock::new(Bitfield::new(1)));
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let (have_tx, mut have_rx) = mpsc::channel(4);

        dispatch(
            Message::Piece { piece_idx: 0, offset: 0, data: data.clone() },
            &ctx,
            addr(),
            &remote_bf,
            &outbound_tx,
            &have_tx,
        )
        .await;

        assert_eq!(ctx.pieces.lock().unwrap()[0], Some(data));
        assert!(ctx.bitfield.lock().unwrap().has(0));
        assert_eq!(outbound_rx.try_recv().unwrap(), Message::Have { piece_idx: 0 });
        assert!(matches!(
            have_rx.try_recv().unwrap(),
            HaveEvent::PieceOwned { piece_idx: 0, .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_piece_for_an_already_owned_index_is_a_no_op() {
        let data = b"the real bytes".to_vec();
        let ctx = ctx_with_one_piece(&data);
        let remote_bf = Arc::new(RwLock::new(Bitfield::new(1)));
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let (have_tx, mut have_rx) = mpsc::channel(4);

        dispatch(
            Message::Piece { piece_idx: 0, offset: 0, data: data.clone() },
            &ctx,
            addr(),
            &remote_bf,
            &outbound_tx,
            &have_tx,
        )
        .await;
        outbound_rx.try_recv().unwrap();
        have_rx.try_recv().unwrap();

        dispatch(
            Message::Piece { piece_idx: 0, offset: 0, data },
            &ctx,
            addr(),
            &remote_bf,
            &outbound_tx,
            &have_tx,
        )
        .await;

        assert!(outbound_rx.try_recv().is_err());
        assert!(have_rx.try_recv().is_err());
    }
}

mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::bitfield::Bitfield;
use crate::shared::TorrentContext;
use crate::wire::{Message, WireError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Notification a peer session sends back towards the swarm.
///
/// `PieceOwned` fires once a Piece message verifies against its hash and
/// is stored locally — the swarm must broadcast Have to every other peer
/// and stop tracking the piece as missing. `Departed` is the unified
/// "gone" signal session termination raises, equivalent to the wire
/// protocol's on_have(-1). Availability bookkeeping itself is pulled
/// directly from each peer's live remote bitfield on every swarm tick
/// rather than pushed incrementally.
#[derive(Debug, Clone)]
pub enum HaveEvent {
    PieceOwned { source: SocketAddr, piece_idx: usize },
    Departed { peer: SocketAddr },
}

/// A live peer session as seen by the swarm: an outbound queue to enqueue
/// messages on (handshake/bitfield already sent), a live view of the
/// remote's bitfield, and the two background tasks driving the wire.
pub struct PeerHandle {
    pub address: SocketAddr,
    pub outbound: mpsc::Sender<Message>,
    pub remote_bitfield: Arc<RwLock<Bitfield>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn abort(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Opens a TCP connection to `address` and starts its session tasks.
/// Used by the swarm's dial loop.
pub async fn dial(
    address: SocketAddr,
    ctx: Arc<TorrentContext>,
    have_tx: mpsc::Sender<HaveEvent>,
) -> Result<PeerHandle> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| PeerError::ConnectTimeout(address))??;
    Ok(session::spawn(address, stream, ctx, have_tx).await)
}

/// Starts session tasks for a socket already accepted by a listener. Used
/// by the seeding accept loop.
pub async fn accept(
    address: SocketAddr,
    stream: TcpStream,
    ctx: Arc<TorrentContext>,
    have_tx: mpsc::Sender<HaveEvent>,
) -> PeerHandle {
    session::spawn(address, stream, ctx, have_tx).await
}

/// Builds a `PeerHandle` with no socket behind it, for exercising the
/// swarm's picker logic without a real TCP connection. The returned
/// receiver lets a test observe what the swarm would have sent on the
/// wire; the "reader"/"writer" tasks are no-ops since nothing ever reads
/// from the other end of a loopback socket.
#[cfg(test)]
pub fn test_handle(address: SocketAddr, bitfield: Bitfield) -> (PeerHandle, mpsc::Receiver<Message>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let remote_bitfield = Arc::new(RwLock::new(bitfield));
    let reader_task = tokio::spawn(std::future::pending());
    let writer_task = tokio::spawn(std::future::pending());
    let handle = PeerHandle { address, outbound: outbound_tx, remote_bitfield, reader_task, writer_task };
    (handle, outbound_rx)
}

//! P2P-over-internet driver: direct TCP links bootstrapped by
//! signaling blobs exchanged over a rendezvous channel.
//!
//! The blob carries candidate `ip:port` endpoints; the driver dials
//! them in order and keeps the first connection that completes the
//! hello exchange. Frames are newline-delimited JSON; payloads stay
//! opaque.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{DriverEvent, TransportDriver};
use crate::error::TransportError;
use crate::queue::SendQueue;
use crate::types::{NodeId, PeerDescriptor, SignalBlob, TransportKind};

const SEND_QUEUE_CAPACITY: usize = 64;
const MAX_LINE: usize = 8 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum P2pFrame {
    Hello { peer: PeerDescriptor },
    Data { payload: Vec<u8> },
}

struct ConnHandle {
    queue: Arc<SendQueue<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

struct P2pInner {
    local: PeerDescriptor,
    /// Extra endpoints to advertise in signaling blobs (public addrs).
    advertise: Vec<String>,
    events: mpsc::Sender<DriverEvent>,
    conns: Mutex<HashMap<NodeId, ConnHandle>>,
    bound: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    available: AtomicBool,
}

/// Direct peer-to-peer transport over TCP.
#[derive(Clone)]
pub struct P2pDriver {
    inner: Arc<P2pInner>,
    port: u16,
}

impl P2pDriver {
    /// `port` 0 binds an ephemeral port; `advertise` lists extra
    /// endpoints (e.g. a public address) included in signaling blobs.
    pub fn new(
        local: PeerDescriptor,
        port: u16,
        advertise: Vec<String>,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(P2pInner {
                local,
                advertise,
                events,
                conns: Mutex::new(HashMap::new()),
                bound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                available: AtomicBool::new(false),
            }),
            port,
        }
    }

    /// The signaling blob to publish through the rendezvous channel.
    /// `None` until the driver is started.
    pub fn local_signal(&self) -> Option<SignalBlob> {
        let bound = (*self.inner.bound.lock().expect("bound lock"))?;
        let mut addrs = vec![format!("127.0.0.1:{}", bound.port())];
        addrs.extend(self.inner.advertise.iter().cloned());
        Some(SignalBlob {
            node_id: self.inner.local.id.clone(),
            addrs,
        })
    }

    /// Apply a peer's signaling blob: dial its candidates in order and
    /// keep the first connection that completes the hello exchange.
    pub async fn connect_signal(&self, blob: &SignalBlob) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        if blob.node_id == self.inner.local.id {
            return Ok(());
        }
        if self
            .inner
            .conns
            .lock()
            .expect("conns lock")
            .contains_key(&blob.node_id)
        {
            return Ok(());
        }

        let mut last_err: Option<std::io::Error> = None;
        for addr in &blob.addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => match handshake_outbound(&self.inner, stream).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!("p2p: handshake with {addr} failed: {e}");
                    }
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(TransportError::Connect {
            addr: blob.addrs.join(","),
            source: last_err
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no candidates")),
        })
    }
}

#[async_trait::async_trait]
impl TransportDriver for P2pDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::P2p
    }

    async fn start(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| TransportError::Bind {
                kind: TransportKind::P2p,
                source,
            })?;
        let bound = listener.local_addr().map_err(|source| TransportError::Bind {
            kind: TransportKind::P2p,
            source,
        })?;
        *self.inner.bound.lock().expect("bound lock") = Some(bound);

        let inner = self.inner.clone();
        self.inner
            .tasks
            .lock()
            .expect("tasks lock")
            .push(tokio::spawn(accept_loop(inner, listener)));

        self.inner.available.store(true, Ordering::SeqCst);
        let _ = self
            .inner
            .events
            .send(DriverEvent::AvailableChanged {
                transport: TransportKind::P2p,
                available: true,
            })
            .await;
        Ok(())
    }

    async fn stop(&self) {
        for task in self.inner.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        let conns: Vec<ConnHandle> = {
            let mut map = self.inner.conns.lock().expect("conns lock");
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            for task in conn.tasks {
                task.abort();
            }
        }
        *self.inner.bound.lock().expect("bound lock") = None;
        if self.inner.available.swap(false, Ordering::SeqCst) {
            let _ = self
                .inner
                .events
                .send(DriverEvent::AvailableChanged {
                    transport: TransportKind::P2p,
                    available: false,
                })
                .await;
        }
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        let frame = encode_frame(&P2pFrame::Data {
            payload: bytes.to_vec(),
        })?;
        let queues: Vec<(NodeId, Arc<SendQueue<Vec<u8>>>)> = {
            let conns = self.inner.conns.lock().expect("conns lock");
            conns
                .iter()
                .map(|(id, c)| (id.clone(), c.queue.clone()))
                .collect()
        };
        for (peer_id, queue) in queues {
            if queue.push(frame.clone()).is_some() {
                let _ = self.inner.events.try_send(DriverEvent::SendFailed {
                    transport: TransportKind::P2p,
                    peer_id: Some(peer_id),
                });
            }
        }
        Ok(())
    }

    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        let queue = self
            .inner
            .conns
            .lock()
            .expect("conns lock")
            .get(peer)
            .map(|c| c.queue.clone())
            .ok_or_else(|| TransportError::PeerUnknown(peer.clone()))?;
        let frame = encode_frame(&P2pFrame::Data {
            payload: bytes.to_vec(),
        })?;
        if queue.push(frame).is_some() {
            let _ = self.inner.events.try_send(DriverEvent::SendFailed {
                transport: TransportKind::P2p,
                peer_id: Some(peer.clone()),
            });
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .conns
            .lock()
            .expect("conns lock")
            .keys()
            .cloned()
            .collect()
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

fn encode_frame(frame: &P2pFrame) -> Result<Vec<u8>, TransportError> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

async fn accept_loop(inner: Arc<P2pInner>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("p2p: accept failed: {e}");
                continue;
            }
        };
        debug!("p2p: inbound connection from {addr}");
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake_inbound(&inner, stream).await {
                debug!("p2p: inbound handshake failed: {e}");
            }
        });
    }
}

/// Inbound side: peer speaks first, then we answer with our hello.
async fn handshake_inbound(inner: &Arc<P2pInner>, stream: TcpStream) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE as u64);

    let peer = read_hello(&mut reader).await?;
    let hello = encode_frame(&P2pFrame::Hello {
        peer: inner.local.clone(),
    })?;
    write_half
        .write_all(&hello)
        .await
        .map_err(|source| TransportError::Send {
            peer: peer.id.clone(),
            source,
        })?;

    register_conn(inner, peer, reader, write_half).await;
    Ok(())
}

/// Outbound side: we speak first, peer answers.
async fn handshake_outbound(inner: &Arc<P2pInner>, stream: TcpStream) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE as u64);

    let hello = encode_frame(&P2pFrame::Hello {
        peer: inner.local.clone(),
    })?;
    write_half
        .write_all(&hello)
        .await
        .map_err(|source| TransportError::Send {
            peer: inner.local.id.clone(),
            source,
        })?;
    let peer = read_hello(&mut reader).await?;

    register_conn(inner, peer, reader, write_half).await;
    Ok(())
}

async fn read_hello(
    reader: &mut tokio::io::Take<BufReader<OwnedReadHalf>>,
) -> Result<PeerDescriptor, TransportError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| TransportError::Connect {
            addr: "peer".into(),
            source: e,
        })?;
    reader.set_limit(MAX_LINE as u64);
    match serde_json::from_str(&line)? {
        P2pFrame::Hello { peer } => Ok(peer),
        P2pFrame::Data { .. } => Err(TransportError::Connect {
            addr: "peer".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "data before hello"),
        }),
    }
}

async fn register_conn(
    inner: &Arc<P2pInner>,
    peer: PeerDescriptor,
    reader: tokio::io::Take<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
) {
    let peer_id = peer.id.clone();
    let queue = Arc::new(SendQueue::new(SEND_QUEUE_CAPACITY));

    {
        let mut conns = inner.conns.lock().expect("conns lock");
        if conns.contains_key(&peer_id) {
            return; // simultaneous dial — keep the first connection
        }
        let tasks = vec![
            tokio::spawn(conn_writer(
                inner.clone(),
                peer_id.clone(),
                queue.clone(),
                write_half,
            )),
            tokio::spawn(conn_reader(inner.clone(), peer_id.clone(), reader)),
        ];
        conns.insert(peer_id.clone(), ConnHandle { queue, tasks });
    }

    let _ = inner
        .events
        .send(DriverEvent::PeerObserved {
            transport: TransportKind::P2p,
            peer,
        })
        .await;
}

async fn conn_writer(
    inner: Arc<P2pInner>,
    peer_id: NodeId,
    queue: Arc<SendQueue<Vec<u8>>>,
    mut write_half: OwnedWriteHalf,
) {
    loop {
        let frame = queue.pop().await;
        if let Err(e) = write_half.write_all(&frame).await {
            debug!("p2p: write to {peer_id} failed: {e}");
            let _ = inner.events.try_send(DriverEvent::SendFailed {
                transport: TransportKind::P2p,
                peer_id: Some(peer_id.clone()),
            });
            drop_conn(&inner, &peer_id).await;
            return;
        }
    }
}

async fn conn_reader(
    inner: Arc<P2pInner>,
    peer_id: NodeId,
    mut reader: tokio::io::Take<BufReader<OwnedReadHalf>>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break, // closed
            Ok(_) => reader.set_limit(MAX_LINE as u64),
        }
        match serde_json::from_str::<P2pFrame>(&line) {
            Ok(P2pFrame::Data { payload }) => {
                let _ = inner
                    .events
                    .send(DriverEvent::Bytes {
                        transport: TransportKind::P2p,
                        from: peer_id.clone(),
                        bytes: payload,
                    })
                    .await;
            }
            Ok(P2pFrame::Hello { .. }) => {} // late hello — ignore
            Err(e) => {
                debug!("p2p: bad frame from {peer_id}: {e}");
            }
        }
    }
    drop_conn(&inner, &peer_id).await;
}

async fn drop_conn(inner: &Arc<P2pInner>, peer_id: &NodeId) {
    let removed = {
        let mut conns = inner.conns.lock().expect("conns lock");
        conns.remove(peer_id)
    };
    if let Some(conn) = removed {
        // Emit before aborting: one of the aborted tasks is the caller.
        let _ = inner
            .events
            .send(DriverEvent::PeerLost {
                transport: TransportKind::P2p,
                peer_id: peer_id.clone(),
            })
            .await;
        for task in conn.tasks {
            task.abort();
        }
    }
}

//! Relay client — the rendezvous transport driver.
//!
//! Implements the standard driver contract (live forward/broadcast of
//! opaque payloads, peer observations from the relay's device table)
//! plus the record-store operations the protocol runtime uses for
//! store-and-forward sync: message upserts, inbox fetch, presence.
//!
//! The connection task reconnects forever with a fixed backoff; each
//! successful reconnect flips availability, which is the runtime's
//! signal to drain its pending queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use weft_transport::queue::SendQueue;
use weft_transport::{
    DriverEvent, NodeId, PeerDescriptor, SignalBlob, TransportDriver, TransportError, TransportKind,
};

use crate::error::RelayError;
use crate::wire::{encode_line, ClientFrame, DeviceEntry, MessageRecord, PresenceRecord, ServerFrame};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const INBOX_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_QUEUE_CAPACITY: usize = 128;
const MAX_LINE: usize = 64 * 1024;

struct RelayInner {
    local: DeviceEntry,
    server_addr: String,
    events: mpsc::Sender<DriverEvent>,
    queue: SendQueue<ClientFrame>,
    peers: Mutex<HashMap<NodeId, DeviceEntry>>,
    pending_inbox: Mutex<Option<oneshot::Sender<Vec<MessageRecord>>>>,
    available: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Transport driver backed by a rendezvous relay server.
#[derive(Clone)]
pub struct RelayDriver {
    inner: Arc<RelayInner>,
}

impl RelayDriver {
    pub fn new(
        local_id: NodeId,
        local_name: String,
        local_device_type: String,
        server_addr: String,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                local: DeviceEntry {
                    device_id: local_id,
                    device_name: local_name,
                    device_type: local_device_type,
                    is_online: true,
                    last_seen: 0,
                },
                server_addr,
                events,
                queue: SendQueue::new(SEND_QUEUE_CAPACITY),
                peers: Mutex::new(HashMap::new()),
                pending_inbox: Mutex::new(None),
                available: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn enqueue(&self, frame: ClientFrame) {
        if self.inner.queue.push(frame).is_some() {
            let _ = self.inner.events.try_send(DriverEvent::SendFailed {
                transport: TransportKind::Relay,
                peer_id: None,
            });
        }
    }

    // ── Record-store operations ────────────────────────────────────────

    /// Mirror an outgoing message into the relay's store-and-forward
    /// table. Idempotent upsert; queued until the relay is reachable.
    pub fn store_message(&self, record: MessageRecord) {
        self.enqueue(ClientFrame::StoreMessage { record });
    }

    /// Flag a stored record as delivered after local admission.
    pub fn mark_delivered(&self, message_id: String) {
        self.enqueue(ClientFrame::MarkDelivered { message_id });
    }

    /// Idempotent presence upsert (online/typing state).
    pub fn publish_presence(&self, presence: PresenceRecord) {
        self.enqueue(ClientFrame::Presence { presence });
    }

    /// Hand a signaling blob to another device via the relay.
    pub fn send_signal(&self, to: NodeId, blob: SignalBlob) {
        self.enqueue(ClientFrame::Signal { to, blob });
    }

    /// Fetch undelivered store-and-forward records addressed to us.
    pub async fn fetch_inbox(&self) -> Result<Vec<MessageRecord>, RelayError> {
        if !self.is_available() {
            return Err(RelayError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        *self.inner.pending_inbox.lock().expect("inbox lock") = Some(tx);
        self.enqueue(ClientFrame::FetchInbox);
        match tokio::time::timeout(INBOX_TIMEOUT, rx).await {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(_)) => Err(RelayError::Disconnected),
            Err(_) => Err(RelayError::Timeout),
        }
    }
}

#[async_trait::async_trait]
impl TransportDriver for RelayDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn start(&self) -> Result<(), TransportError> {
        let inner = self.inner.clone();
        self.inner
            .tasks
            .lock()
            .expect("tasks lock")
            .push(tokio::spawn(connection_loop(inner)));
        Ok(())
    }

    async fn stop(&self) {
        // Best-effort offline flush before tearing the session down.
        self.publish_presence(PresenceRecord {
            is_online: false,
            is_typing: false,
            typing_to: None,
            last_heartbeat: 0,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        for task in self.inner.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        self.inner.peers.lock().expect("peers lock").clear();
        if self.inner.available.swap(false, Ordering::SeqCst) {
            let _ = self
                .inner
                .events
                .send(DriverEvent::AvailableChanged {
                    transport: TransportKind::Relay,
                    available: false,
                })
                .await;
        }
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        self.enqueue(ClientFrame::Broadcast {
            payload: bytes.to_vec(),
        });
        Ok(())
    }

    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        if !self.inner.peers.lock().expect("peers lock").contains_key(peer) {
            return Err(TransportError::PeerUnknown(peer.clone()));
        }
        self.enqueue(ClientFrame::Forward {
            to: peer.clone(),
            payload: bytes.to_vec(),
        });
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .peers
            .lock()
            .expect("peers lock")
            .keys()
            .cloned()
            .collect()
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

async fn connection_loop(inner: Arc<RelayInner>) {
    loop {
        match TcpStream::connect(&inner.server_addr).await {
            Ok(stream) => {
                info!("relay client: connected to {}", inner.server_addr);
                run_session(&inner, stream).await;
                info!("relay client: session to {} ended", inner.server_addr);
            }
            Err(e) => {
                debug!("relay client: connect to {} failed: {e}", inner.server_addr);
            }
        }
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    }
}

async fn run_session(inner: &Arc<RelayInner>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE as u64);

    let hello = match encode_line(&ClientFrame::Hello {
        device: inner.local.clone(),
    }) {
        Ok(line) => line,
        Err(_) => return,
    };
    if write_half.write_all(&hello).await.is_err() {
        return;
    }

    inner.available.store(true, Ordering::SeqCst);
    let _ = inner
        .events
        .send(DriverEvent::AvailableChanged {
            transport: TransportKind::Relay,
            available: true,
        })
        .await;

    // Writer: drains the shared frame queue while the session lives.
    let writer_inner = inner.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = writer_inner.queue.pop().await;
            let line = match encode_line(&frame) {
                Ok(line) => line,
                Err(_) => continue,
            };
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    // Reader: server frames → driver events.
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => reader.set_limit(MAX_LINE as u64),
        }
        let frame = match serde_json::from_str::<ServerFrame>(&line) {
            Ok(f) => f,
            Err(e) => {
                debug!("relay client: bad frame: {e}");
                continue;
            }
        };
        handle_server_frame(inner, frame).await;
    }

    writer.abort();
    inner.available.store(false, Ordering::SeqCst);
    let _ = inner
        .events
        .send(DriverEvent::AvailableChanged {
            transport: TransportKind::Relay,
            available: false,
        })
        .await;
    let lost: Vec<NodeId> = inner
        .peers
        .lock()
        .expect("peers lock")
        .drain()
        .map(|(id, _)| id)
        .collect();
    for peer_id in lost {
        let _ = inner
            .events
            .send(DriverEvent::PeerLost {
                transport: TransportKind::Relay,
                peer_id,
            })
            .await;
    }
}

fn descriptor_from_entry(entry: &DeviceEntry) -> PeerDescriptor {
    PeerDescriptor {
        id: entry.device_id.clone(),
        name: Some(entry.device_name.clone()),
        device_type: Some(entry.device_type.clone()),
        signal_strength: None,
    }
}

async fn handle_server_frame(inner: &Arc<RelayInner>, frame: ServerFrame) {
    match frame {
        ServerFrame::Welcome { devices } => {
            for device in devices {
                let descriptor = descriptor_from_entry(&device);
                inner
                    .peers
                    .lock()
                    .expect("peers lock")
                    .insert(device.device_id.clone(), device);
                let _ = inner
                    .events
                    .send(DriverEvent::PeerObserved {
                        transport: TransportKind::Relay,
                        peer: descriptor,
                    })
                    .await;
            }
        }
        ServerFrame::PeerOnline { device } => {
            let descriptor = descriptor_from_entry(&device);
            inner
                .peers
                .lock()
                .expect("peers lock")
                .insert(device.device_id.clone(), device);
            let _ = inner
                .events
                .send(DriverEvent::PeerObserved {
                    transport: TransportKind::Relay,
                    peer: descriptor,
                })
                .await;
        }
        ServerFrame::PeerOffline { device_id } => {
            inner.peers.lock().expect("peers lock").remove(&device_id);
            let _ = inner
                .events
                .send(DriverEvent::PeerLost {
                    transport: TransportKind::Relay,
                    peer_id: device_id,
                })
                .await;
        }
        ServerFrame::Inbox { records } => {
            let pending = inner.pending_inbox.lock().expect("inbox lock").take();
            if let Some(tx) = pending {
                let _ = tx.send(records);
            }
        }
        ServerFrame::Signal { from, blob } => {
            let _ = inner.events.send(DriverEvent::Signal { from, blob }).await;
        }
        ServerFrame::Deliver { from, payload } => {
            let _ = inner
                .events
                .send(DriverEvent::Bytes {
                    transport: TransportKind::Relay,
                    from,
                    bytes: payload,
                })
                .await;
        }
    }
}

//! Relay server: accepts device sessions, tracks the record stores,
//! and fans live payloads between connected peers.
//!
//! All record writes are idempotent upserts. State is in-memory — the
//! relay is a rendezvous point, not a second durability layer; the
//! store-and-forward records live until delivered plus a grace window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use weft_transport::NodeId;

use crate::error::RelayError;
use crate::wire::{encode_line, ClientFrame, DeviceEntry, MessageRecord, PresenceRecord, ServerFrame};

/// Delivered store-and-forward records are kept this long before
/// eviction (late duplicate fetches still see the delivered status).
const DELIVERED_RECORD_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// A presence row without a session or a heartbeat this old goes
/// offline.
const PRESENCE_TTL_MS: u64 = 60_000;

/// Maintenance cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

const SESSION_BUFFER: usize = 64;
const MAX_LINE: usize = 64 * 1024;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

#[derive(Default)]
struct RelayState {
    devices: HashMap<NodeId, DeviceEntry>,
    messages: HashMap<String, MessageRecord>,
    presence: HashMap<NodeId, PresenceRecord>,
    sessions: HashMap<NodeId, mpsc::Sender<ServerFrame>>,
}

impl RelayState {
    fn session(&self, id: &NodeId) -> Option<mpsc::Sender<ServerFrame>> {
        self.sessions.get(id).cloned()
    }

    fn online_devices(&self) -> Vec<DeviceEntry> {
        self.devices.values().filter(|d| d.is_online).cloned().collect()
    }

    fn evict_delivered(&mut self, now: u64) -> usize {
        let before = self.messages.len();
        self.messages
            .retain(|_, r| r.status != "delivered" || now.saturating_sub(r.created_at) < DELIVERED_RECORD_TTL_MS);
        before - self.messages.len()
    }

    fn expire_presence(&mut self, now: u64) -> usize {
        let sessions = &self.sessions;
        let mut expired = 0;
        for (id, presence) in self.presence.iter_mut() {
            if presence.is_online
                && !sessions.contains_key(id)
                && now.saturating_sub(presence.last_heartbeat) > PRESENCE_TTL_MS
            {
                presence.is_online = false;
                presence.is_typing = false;
                presence.typing_to = None;
                expired += 1;
            }
        }
        expired
    }
}

/// The rendezvous relay service.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<Mutex<RelayState>>,
}

impl RelayServer {
    /// Bind the listener. `addr` like `"0.0.0.0:4700"` or
    /// `"127.0.0.1:0"` for an ephemeral test port.
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await.map_err(RelayError::Bind)?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(RelayState::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::Bind)
    }

    /// Accept sessions until the task is cancelled.
    pub async fn run(self) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tick.tick().await;
                let now = now_ms();
                let (evicted, expired) = {
                    let mut st = state.lock().expect("relay state");
                    (st.evict_delivered(now), st.expire_presence(now))
                };
                if evicted > 0 || expired > 0 {
                    debug!("relay: evicted {evicted} delivered records, expired {expired} presence rows");
                }
            }
        });

        info!(
            "relay: listening on {}",
            self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("relay: accept failed: {e}");
                    continue;
                }
            };
            debug!("relay: session from {addr}");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_session(state, stream).await {
                    debug!("relay: session from {addr} ended: {e}");
                }
            });
        }
    }
}

async fn handle_session(
    state: Arc<Mutex<RelayState>>,
    stream: TcpStream,
) -> Result<(), RelayError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE as u64);

    // First frame must be Hello.
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|_| RelayError::Disconnected)?;
    reader.set_limit(MAX_LINE as u64);
    let device = match serde_json::from_str::<ClientFrame>(&line)? {
        ClientFrame::Hello { mut device } => {
            device.is_online = true;
            device.last_seen = now_ms();
            device
        }
        _ => {
            return Err(RelayError::Protocol {
                device_id: NodeId::wildcard(),
                reason: "first frame was not hello".into(),
            })
        }
    };
    let device_id = device.device_id.clone();

    // Register the session, greet, announce.
    let (session_tx, mut session_rx) = mpsc::channel::<ServerFrame>(SESSION_BUFFER);
    let (welcome, announce_to) = {
        let mut st = state.lock().expect("relay state");
        st.devices.insert(device_id.clone(), device.clone());
        st.presence.insert(
            device_id.clone(),
            PresenceRecord {
                is_online: true,
                is_typing: false,
                typing_to: None,
                last_heartbeat: now_ms(),
            },
        );
        st.sessions.insert(device_id.clone(), session_tx);
        let others: Vec<_> = st
            .sessions
            .iter()
            .filter(|(id, _)| **id != device_id)
            .map(|(_, tx)| tx.clone())
            .collect();
        let welcome = ServerFrame::Welcome {
            devices: st
                .online_devices()
                .into_iter()
                .filter(|d| d.device_id != device_id)
                .collect(),
        };
        (welcome, others)
    };
    info!("relay: {device_id} online");
    send_frame(&mut write_half, &welcome).await?;
    for tx in announce_to {
        let _ = tx
            .send(ServerFrame::PeerOnline {
                device: device.clone(),
            })
            .await;
    }

    // Writer: session channel → socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = session_rx.recv().await {
            if send_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    // Reader: socket → state mutations.
    let result = session_read_loop(&state, &device_id, &mut reader).await;

    // Session teardown: offline, keep the device record.
    writer.abort();
    let announce_to = {
        let mut st = state.lock().expect("relay state");
        st.sessions.remove(&device_id);
        if let Some(d) = st.devices.get_mut(&device_id) {
            d.is_online = false;
            d.last_seen = now_ms();
        }
        if let Some(p) = st.presence.get_mut(&device_id) {
            p.is_online = false;
            p.is_typing = false;
            p.typing_to = None;
        }
        st.sessions.values().cloned().collect::<Vec<_>>()
    };
    info!("relay: {device_id} offline");
    for tx in announce_to {
        let _ = tx
            .send(ServerFrame::PeerOffline {
                device_id: device_id.clone(),
            })
            .await;
    }
    result
}

async fn session_read_loop(
    state: &Arc<Mutex<RelayState>>,
    device_id: &NodeId,
    reader: &mut tokio::io::Take<BufReader<tokio::net::tcp::OwnedReadHalf>>,
) -> Result<(), RelayError> {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return Ok(()),
            Ok(_) => reader.set_limit(MAX_LINE as u64),
        }
        let frame = match serde_json::from_str::<ClientFrame>(&line) {
            Ok(f) => f,
            Err(e) => {
                debug!("relay: bad frame from {device_id}: {e}");
                continue;
            }
        };
        match frame {
            ClientFrame::Hello { .. } => {} // duplicate hello — ignore
            ClientFrame::Presence { presence } => {
                let mut st = state.lock().expect("relay state");
                st.presence.insert(device_id.clone(), presence);
                if let Some(d) = st.devices.get_mut(device_id) {
                    d.last_seen = now_ms();
                }
            }
            ClientFrame::StoreMessage { record } => {
                let mut st = state.lock().expect("relay state");
                st.messages.insert(record.message_id.clone(), record);
            }
            ClientFrame::FetchInbox => {
                let (session, records) = {
                    let st = state.lock().expect("relay state");
                    let records: Vec<MessageRecord> = st
                        .messages
                        .values()
                        .filter(|r| r.receiver_id == *device_id && r.status != "delivered")
                        .cloned()
                        .collect();
                    (st.session(device_id), records)
                };
                if let Some(tx) = session {
                    let _ = tx.send(ServerFrame::Inbox { records }).await;
                }
            }
            ClientFrame::MarkDelivered { message_id } => {
                let mut st = state.lock().expect("relay state");
                if let Some(record) = st.messages.get_mut(&message_id) {
                    record.status = "delivered".into();
                }
            }
            ClientFrame::Signal { to, blob } => {
                let session = state.lock().expect("relay state").session(&to);
                if let Some(tx) = session {
                    let _ = tx
                        .send(ServerFrame::Signal {
                            from: device_id.clone(),
                            blob,
                        })
                        .await;
                }
            }
            ClientFrame::Forward { to, payload } => {
                let session = state.lock().expect("relay state").session(&to);
                if let Some(tx) = session {
                    let _ = tx
                        .send(ServerFrame::Deliver {
                            from: device_id.clone(),
                            payload,
                        })
                        .await;
                }
            }
            ClientFrame::Broadcast { payload } => {
                let sessions: Vec<_> = {
                    let st = state.lock().expect("relay state");
                    st.sessions
                        .iter()
                        .filter(|(id, _)| **id != *device_id)
                        .map(|(_, tx)| tx.clone())
                        .collect()
                };
                for tx in sessions {
                    let _ = tx
                        .send(ServerFrame::Deliver {
                            from: device_id.clone(),
                            payload: payload.clone(),
                        })
                        .await;
                }
            }
        }
    }
}

async fn send_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &ServerFrame,
) -> Result<(), RelayError> {
    let line = encode_line(frame)?;
    writer
        .write_all(&line)
        .await
        .map_err(|_| RelayError::Disconnected)
}

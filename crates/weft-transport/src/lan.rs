//! Same-host / LAN driver: UDP multicast beacon + datagram payloads.
//!
//! Every instance joins one multicast group and announces itself with
//! a periodic driver-level beacon. Data payloads ride in their own
//! datagrams, addressed either to the group (broadcast) or to the
//! peer's last observed source address (unicast). Multicast loopback
//! stays enabled so co-located processes on one host see each other.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{DriverEvent, TransportDriver};
use crate::error::TransportError;
use crate::queue::SendQueue;
use crate::types::{NodeId, PeerDescriptor, TransportKind};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 71, 17);
const DEFAULT_PORT: u16 = 47_701;
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const PEER_TIMEOUT: Duration = Duration::from_secs(8);
const SEND_QUEUE_CAPACITY: usize = 128;
const MAX_DATAGRAM: usize = 2_048;

/// One datagram on the wire. `Data` payloads are opaque to the driver.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum LanFrame {
    Beacon { peer: PeerDescriptor },
    Data { from: NodeId, payload: Vec<u8> },
}

struct LanPeer {
    addr: SocketAddr,
    last_seen: Instant,
}

struct LanInner {
    local: PeerDescriptor,
    port: u16,
    events: mpsc::Sender<DriverEvent>,
    peers: Mutex<HashMap<NodeId, LanPeer>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    queue: SendQueue<(SocketAddr, Vec<u8>)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    available: AtomicBool,
}

/// UDP multicast transport for the local network and co-located
/// processes on the same host.
#[derive(Clone)]
pub struct LanDriver {
    inner: Arc<LanInner>,
}

impl LanDriver {
    pub fn new(local: PeerDescriptor, events: mpsc::Sender<DriverEvent>) -> Self {
        Self::with_port(local, DEFAULT_PORT, events)
    }

    /// Use a non-default port (isolated test groups).
    pub fn with_port(local: PeerDescriptor, port: u16, events: mpsc::Sender<DriverEvent>) -> Self {
        Self {
            inner: Arc::new(LanInner {
                local,
                port,
                events,
                peers: Mutex::new(HashMap::new()),
                socket: Mutex::new(None),
                queue: SendQueue::new(SEND_QUEUE_CAPACITY),
                tasks: Mutex::new(Vec::new()),
                available: AtomicBool::new(false),
            }),
        }
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::from((MULTICAST_GROUP, self.inner.port))
    }

    /// Multicast socket with SO_REUSEADDR/SO_REUSEPORT so several
    /// processes on one host can share the group port.
    fn bind_multicast(port: u16) -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let addr: SocketAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into())?;
        let socket: std::net::UdpSocket = socket.into();
        socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn enqueue(&self, dest: SocketAddr, frame: &LanFrame) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(frame)?;
        if self.inner.queue.push((dest, bytes)).is_some() {
            // Oldest frame dropped; tell the selector.
            let _ = self.inner.events.try_send(DriverEvent::SendFailed {
                transport: TransportKind::Lan,
                peer_id: None,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TransportDriver for LanDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn start(&self) -> Result<(), TransportError> {
        let std_socket = Self::bind_multicast(self.inner.port).map_err(|source| {
            TransportError::Bind {
                kind: TransportKind::Lan,
                source,
            }
        })?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(|source| {
            TransportError::Bind {
                kind: TransportKind::Lan,
                source,
            }
        })?);
        *self.inner.socket.lock().expect("socket lock") = Some(socket.clone());

        {
            let mut tasks = self.inner.tasks.lock().expect("tasks lock");
            tasks.push(tokio::spawn(beacon_loop(
                self.inner.clone(),
                self.group_addr(),
            )));
            tasks.push(tokio::spawn(recv_loop(self.inner.clone(), socket.clone())));
            tasks.push(tokio::spawn(writer_loop(self.inner.clone(), socket)));
            tasks.push(tokio::spawn(timeout_loop(self.inner.clone())));
        }

        self.inner.available.store(true, Ordering::SeqCst);
        let _ = self
            .inner
            .events
            .send(DriverEvent::AvailableChanged {
                transport: TransportKind::Lan,
                available: true,
            })
            .await;
        Ok(())
    }

    async fn stop(&self) {
        for task in self.inner.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        *self.inner.socket.lock().expect("socket lock") = None;
        self.inner.peers.lock().expect("peers lock").clear();
        if self.inner.available.swap(false, Ordering::SeqCst) {
            let _ = self
                .inner
                .events
                .send(DriverEvent::AvailableChanged {
                    transport: TransportKind::Lan,
                    available: false,
                })
                .await;
        }
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        let frame = LanFrame::Data {
            from: self.inner.local.id.clone(),
            payload: bytes.to_vec(),
        };
        self.enqueue(self.group_addr(), &frame)
    }

    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        let addr = self
            .inner
            .peers
            .lock()
            .expect("peers lock")
            .get(peer)
            .map(|p| p.addr)
            .ok_or_else(|| TransportError::PeerUnknown(peer.clone()))?;
        let frame = LanFrame::Data {
            from: self.inner.local.id.clone(),
            payload: bytes.to_vec(),
        };
        self.enqueue(addr, &frame)
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

async fn beacon_loop(inner: Arc<LanInner>, group: SocketAddr) {
    let mut tick = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tick.tick().await;
        let frame = LanFrame::Beacon {
            peer: inner.local.clone(),
        };
        match serde_json::to_vec(&frame) {
            Ok(bytes) => {
                inner.queue.push((group, bytes));
            }
            Err(e) => warn!("lan: beacon encode failed: {e}"),
        }
    }
}

async fn writer_loop(inner: Arc<LanInner>, socket: Arc<UdpSocket>) {
    loop {
        let (dest, bytes) = inner.queue.pop().await;
        if let Err(e) = socket.send_to(&bytes, dest).await {
            debug!("lan: send to {dest} failed: {e}");
            let _ = inner.events.try_send(DriverEvent::SendFailed {
                transport: TransportKind::Lan,
                peer_id: None,
            });
        }
    }
}

async fn recv_loop(inner: Arc<LanInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("lan: recv failed: {e}");
                continue;
            }
        };
        let frame: LanFrame = match serde_json::from_slice(&buf[..len]) {
            Ok(f) => f,
            Err(_) => continue, // foreign traffic on the group
        };
        match frame {
            LanFrame::Beacon { peer } => {
                if peer.id == inner.local.id {
                    continue;
                }
                let fresh = {
                    let mut peers = inner.peers.lock().expect("peers lock");
                    let fresh = !peers.contains_key(&peer.id);
                    peers.insert(
                        peer.id.clone(),
                        LanPeer {
                            addr,
                            last_seen: Instant::now(),
                        },
                    );
                    fresh
                };
                if fresh {
                    debug!("lan: observed peer {} at {addr}", peer.id);
                }
                let _ = inner
                    .events
                    .send(DriverEvent::PeerObserved {
                        transport: TransportKind::Lan,
                        peer,
                    })
                    .await;
            }
            LanFrame::Data { from, payload } => {
                if from == inner.local.id {
                    continue; // our own multicast loopback
                }
                if let Some(peer) = inner.peers.lock().expect("peers lock").get_mut(&from) {
                    peer.addr = addr;
                    peer.last_seen = Instant::now();
                }
                let _ = inner
                    .events
                    .send(DriverEvent::Bytes {
                        transport: TransportKind::Lan,
                        from,
                        bytes: payload,
                    })
                    .await;
            }
        }
    }
}

async fn timeout_loop(inner: Arc<LanInner>) {
    let mut tick = tokio::time::interval(PEER_TIMEOUT / 2);
    loop {
        tick.tick().await;
        let expired: Vec<NodeId> = {
            let mut peers = inner.peers.lock().expect("peers lock");
            let now = Instant::now();
            let expired: Vec<NodeId> = peers
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_seen) > PEER_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                peers.remove(id);
            }
            expired
        };
        for peer_id in expired {
            debug!("lan: peer {peer_id} timed out");
            let _ = inner
                .events
                .send(DriverEvent::PeerLost {
                    transport: TransportKind::Lan,
                    peer_id,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> PeerDescriptor {
        PeerDescriptor {
            id: id.parse().unwrap(),
            name: Some(format!("node-{id}")),
            device_type: Some("laptop".into()),
            signal_strength: None,
        }
    }

    #[test]
    fn frame_roundtrip() {
        let frame = LanFrame::Data {
            from: "AAAA1111".parse().unwrap(),
            payload: b"{\"id\":\"x\"}".to_vec(),
        };
        let bytes = serde_json::to_vec(&frame).unwrap();
        match serde_json::from_slice(&bytes).unwrap() {
            LanFrame::Data { from, payload } => {
                assert_eq!(from.as_str(), "AAAA1111");
                assert_eq!(payload, b"{\"id\":\"x\"}");
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn beacon_frame_tagged() {
        let frame = LanFrame::Beacon {
            peer: descriptor("BBBB2222"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"beacon\""), "{json}");
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let driver = LanDriver::with_port(descriptor("CCCC3333"), 0, tx);
        let peer: NodeId = "DDDD4444".parse().unwrap();
        assert!(matches!(
            driver.send(&peer, b"x").await,
            Err(TransportError::NotStarted)
        ));
        assert!(!driver.is_available());
    }

    #[tokio::test]
    async fn two_drivers_discover_each_other_on_loopback() {
        // Shared multicast port; skip silently when the sandbox forbids
        // multicast (CI containers without a network namespace).
        let port = 47_911;
        let (tx_a, mut rx_a) = mpsc::channel(64);
        let (tx_b, _rx_b) = mpsc::channel(64);
        let a = LanDriver::with_port(descriptor("AAAA0001"), port, tx_a);
        let b = LanDriver::with_port(descriptor("BBBB0002"), port, tx_b);
        if a.start().await.is_err() || b.start().await.is_err() {
            return;
        }

        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = rx_a.recv() => match event {
                    Some(DriverEvent::PeerObserved { peer, .. })
                        if peer.id.as_str() == "BBBB0002" => break,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                },
                _ = &mut deadline => return, // multicast unavailable here
            }
        }
        assert!(a
            .connected_peers()
            .await
            .iter()
            .any(|p| p.as_str() == "BBBB0002"));
        a.stop().await;
        b.stop().await;
    }
}

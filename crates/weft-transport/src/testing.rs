//! In-memory transport for tests and same-process simulations.
//!
//! A [`MemHub`] models the medium: drivers attach to it, and an
//! explicit link table decides which pairs can hear each other. Tests
//! build arbitrary topologies (A↔B, B↔C but not A↔C) and flip links to
//! simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::driver::{DriverEvent, TransportDriver};
use crate::error::TransportError;
use crate::types::{NodeId, PeerDescriptor, TransportKind};

struct Registered {
    descriptor: PeerDescriptor,
    events: mpsc::Sender<DriverEvent>,
    kind: TransportKind,
}

#[derive(Default)]
struct HubInner {
    nodes: Mutex<HashMap<NodeId, Registered>>,
    links: Mutex<HashSet<(NodeId, NodeId)>>,
}

/// Shared in-memory medium. Clone-cheap.
#[derive(Clone, Default)]
pub struct MemHub {
    inner: Arc<HubInner>,
}

fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver attached to this hub. It registers itself on
    /// `start()`.
    pub fn driver(
        &self,
        descriptor: PeerDescriptor,
        kind: TransportKind,
        events: mpsc::Sender<DriverEvent>,
    ) -> MemDriver {
        MemDriver {
            hub: self.clone(),
            descriptor,
            kind,
            events,
            available: Arc::new(AtomicBool::new(false)),
            fail_sends: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Link two nodes so they can hear each other. Both sides receive
    /// a `PeerObserved` if already attached.
    pub async fn connect(&self, a: &NodeId, b: &NodeId) {
        self.inner
            .links
            .lock()
            .expect("links lock")
            .insert(link_key(a, b));
        let (to_a, to_b) = {
            let nodes = self.inner.nodes.lock().expect("nodes lock");
            let to_a = nodes.get(a).map(|n| (n.events.clone(), n.kind));
            let to_b = nodes.get(b).map(|n| (n.events.clone(), n.kind));
            let desc_a = nodes.get(a).map(|n| n.descriptor.clone());
            let desc_b = nodes.get(b).map(|n| n.descriptor.clone());
            (to_a.zip(desc_b), to_b.zip(desc_a))
        };
        if let Some(((tx, kind), peer)) = to_a {
            let _ = tx.send(DriverEvent::PeerObserved { transport: kind, peer }).await;
        }
        if let Some(((tx, kind), peer)) = to_b {
            let _ = tx.send(DriverEvent::PeerObserved { transport: kind, peer }).await;
        }
    }

    /// Cut the link between two nodes and notify both sides.
    pub async fn disconnect(&self, a: &NodeId, b: &NodeId) {
        self.inner
            .links
            .lock()
            .expect("links lock")
            .remove(&link_key(a, b));
        let (to_a, to_b) = {
            let nodes = self.inner.nodes.lock().expect("nodes lock");
            (
                nodes.get(a).map(|n| (n.events.clone(), n.kind)),
                nodes.get(b).map(|n| (n.events.clone(), n.kind)),
            )
        };
        if let Some((tx, kind)) = to_a {
            let _ = tx
                .send(DriverEvent::PeerLost {
                    transport: kind,
                    peer_id: b.clone(),
                })
                .await;
        }
        if let Some((tx, kind)) = to_b {
            let _ = tx
                .send(DriverEvent::PeerLost {
                    transport: kind,
                    peer_id: a.clone(),
                })
                .await;
        }
    }

    fn linked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.inner
            .links
            .lock()
            .expect("links lock")
            .contains(&link_key(a, b))
    }

    fn neighbors_of(&self, id: &NodeId) -> Vec<(NodeId, mpsc::Sender<DriverEvent>, TransportKind)> {
        let nodes = self.inner.nodes.lock().expect("nodes lock");
        nodes
            .iter()
            .filter(|(other, _)| *other != id && self.linked(id, other))
            .map(|(other, reg)| (other.clone(), reg.events.clone(), reg.kind))
            .collect()
    }
}

/// A transport driver backed by a [`MemHub`].
#[derive(Clone)]
pub struct MemDriver {
    hub: MemHub,
    descriptor: PeerDescriptor,
    kind: TransportKind,
    events: mpsc::Sender<DriverEvent>,
    available: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl MemDriver {
    /// Make every subsequent send/broadcast fail (transport-down tests).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn id(&self) -> &NodeId {
        &self.descriptor.id
    }

    fn send_disabled_err(&self, peer: &NodeId) -> TransportError {
        TransportError::Send {
            peer: peer.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "mem: sends disabled"),
        }
    }
}

#[async_trait::async_trait]
impl TransportDriver for MemDriver {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.hub.inner.nodes.lock().expect("nodes lock").insert(
            self.id().clone(),
            Registered {
                descriptor: self.descriptor.clone(),
                events: self.events.clone(),
                kind: self.kind,
            },
        );
        self.available.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(DriverEvent::AvailableChanged {
                transport: self.kind,
                available: true,
            })
            .await;
        Ok(())
    }

    async fn stop(&self) {
        self.hub
            .inner
            .nodes
            .lock()
            .expect("nodes lock")
            .remove(self.id());
        if self.available.swap(false, Ordering::SeqCst) {
            let _ = self
                .events
                .send(DriverEvent::AvailableChanged {
                    transport: self.kind,
                    available: false,
                })
                .await;
        }
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(self.send_disabled_err(&NodeId::wildcard()));
        }
        for (_, tx, kind) in self.hub.neighbors_of(self.id()) {
            let _ = tx
                .send(DriverEvent::Bytes {
                    transport: kind,
                    from: self.id().clone(),
                    bytes: bytes.to_vec(),
                })
                .await;
        }
        Ok(())
    }

    async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::NotStarted);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(self.send_disabled_err(peer));
        }
        if !self.hub.linked(self.id(), peer) {
            return Err(TransportError::PeerUnknown(peer.clone()));
        }
        let target = {
            let nodes = self.hub.inner.nodes.lock().expect("nodes lock");
            nodes.get(peer).map(|n| (n.events.clone(), n.kind))
        };
        match target {
            Some((tx, kind)) => {
                let _ = tx
                    .send(DriverEvent::Bytes {
                        transport: kind,
                        from: self.id().clone(),
                        bytes: bytes.to_vec(),
                    })
                    .await;
                Ok(())
            }
            None => Err(TransportError::PeerUnknown(peer.clone())),
        }
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        if !self.is_available() {
            return Vec::new();
        }
        self.hub
            .neighbors_of(self.id())
            .into_iter()
            .map(|(id, _, _)| id)
            .collect()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(id.parse().unwrap())
    }

    #[tokio::test]
    async fn linked_peers_exchange_bytes() {
        let hub = MemHub::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = hub.driver(descriptor("AAAA0001"), TransportKind::Lan, tx_a);
        let b = hub.driver(descriptor("BBBB0002"), TransportKind::Lan, tx_b);
        a.start().await.unwrap();
        b.start().await.unwrap();
        hub.connect(&"AAAA0001".parse().unwrap(), &"BBBB0002".parse().unwrap())
            .await;

        // b first sees the PeerObserved from connect()
        match rx_b.recv().await.unwrap() {
            DriverEvent::AvailableChanged { .. } => {}
            other => panic!("expected AvailableChanged, got {other:?}"),
        }
        match rx_b.recv().await.unwrap() {
            DriverEvent::PeerObserved { peer, .. } => assert_eq!(peer.id.as_str(), "AAAA0001"),
            other => panic!("expected PeerObserved, got {other:?}"),
        }

        a.broadcast(b"hello").await.unwrap();
        match rx_b.recv().await.unwrap() {
            DriverEvent::Bytes { from, bytes, .. } => {
                assert_eq!(from.as_str(), "AAAA0001");
                assert_eq!(bytes, b"hello");
            }
            other => panic!("expected Bytes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unlinked_peers_do_not_hear_broadcasts() {
        let hub = MemHub::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_c, mut rx_c) = mpsc::channel(16);
        let a = hub.driver(descriptor("AAAA0001"), TransportKind::Lan, tx_a);
        let c = hub.driver(descriptor("CCCC0003"), TransportKind::Lan, tx_c);
        a.start().await.unwrap();
        c.start().await.unwrap();
        // no link A—C

        a.broadcast(b"secret").await.unwrap();
        // Only the AvailableChanged from start() should be in c's queue.
        match rx_c.try_recv().unwrap() {
            DriverEvent::AvailableChanged { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_sends_errors_out() {
        let hub = MemHub::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let a = hub.driver(descriptor("AAAA0001"), TransportKind::Lan, tx_a);
        let b = hub.driver(descriptor("BBBB0002"), TransportKind::Lan, tx_b);
        a.start().await.unwrap();
        b.start().await.unwrap();
        let id_a: NodeId = "AAAA0001".parse().unwrap();
        let id_b: NodeId = "BBBB0002".parse().unwrap();
        hub.connect(&id_a, &id_b).await;

        a.set_fail_sends(true);
        assert!(a.send(&id_b, b"x").await.is_err());
        assert!(a.broadcast(b"x").await.is_err());
        a.set_fail_sends(false);
        assert!(a.send(&id_b, b"x").await.is_ok());
    }
}

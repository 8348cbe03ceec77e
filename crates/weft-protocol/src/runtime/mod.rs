//! The mesh runtime — wires the pure protocol state to drivers, the
//! durable store, and the application.
//!
//! The application talks to a running node through a channel-based
//! [`MeshHandle`] and a single [`MeshEvent`] stream; it never touches
//! raw bytes or protocol internals.

mod effect;
mod executor;
mod r#loop;
mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use weft_relay::wire::MessageRecord;
use weft_relay::RelayDriver;
use weft_store::MeshStore;
use weft_transport::{LanDriver, P2pDriver, TransportDriver};

use crate::config::MeshConfig;
use crate::error::WeftError;
use crate::identity;
use crate::types::{
    DeviceRecord, Message, MessageStatus, NodeId, PeerDescriptor, TransportKind,
};

pub use effect::{EmitPlan, Feedback, RuntimeEffect};
pub use state::RuntimeState;

// ── Events (runtime → app) ───────────────────────────────────────────

/// Events the application observes.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    DeviceDiscovered(DeviceRecord),
    DeviceUpdated(DeviceRecord),
    DeviceLost(NodeId),
    MessageReceived(Message),
    MessageStatusChanged {
        message_id: String,
        status: MessageStatus,
    },
    ScanStateChanged(bool),
    ConnectionStatusChanged {
        is_online: bool,
        transports: Vec<TransportKind>,
    },
}

// ── Commands (app → runtime) ─────────────────────────────────────────

/// Commands the application sends to the runtime loop.
pub enum MeshCommand {
    SendMessage {
        content: String,
        receiver_id: NodeId,
        reply: oneshot::Sender<Result<String, WeftError>>,
    },
    SetDeviceName {
        name: String,
    },
    StartScanning,
    StopScanning,
    SendTyping {
        receiver_id: NodeId,
        is_typing: bool,
    },
    RetryMessage {
        message_id: String,
        reply: oneshot::Sender<bool>,
    },
    GetDevices {
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
    GetConversation {
        with: NodeId,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Shutdown,
}

// ── Driver set ───────────────────────────────────────────────────────

/// The transports a node carries, plus typed handles for the two
/// drivers with extra surface (relay record ops, P2P signaling).
#[derive(Default)]
pub struct DriverSet {
    drivers: Vec<Arc<dyn TransportDriver>>,
    relay: Option<RelayDriver>,
    p2p: Option<P2pDriver>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, driver: Arc<dyn TransportDriver>) {
        self.drivers.push(driver);
    }

    pub fn set_relay(&mut self, relay: RelayDriver) {
        self.drivers.push(Arc::new(relay.clone()));
        self.relay = Some(relay);
    }

    pub fn set_p2p(&mut self, p2p: P2pDriver) {
        self.drivers.push(Arc::new(p2p.clone()));
        self.p2p = Some(p2p);
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.drivers.iter().map(|d| d.kind()).collect()
    }

    fn all(&self) -> &[Arc<dyn TransportDriver>] {
        &self.drivers
    }

    fn get(&self, kind: TransportKind) -> Option<&Arc<dyn TransportDriver>> {
        self.drivers.iter().find(|d| d.kind() == kind)
    }

    fn relay(&self) -> Option<&RelayDriver> {
        self.relay.as_ref()
    }

    fn p2p(&self) -> Option<&P2pDriver> {
        self.p2p.as_ref()
    }

    pub async fn start_all(&self) {
        for driver in &self.drivers {
            if let Err(e) = driver.start().await {
                // A dead transport is degraded service, not a fatal
                // error; the selector will simply never pick it.
                warn!("driver {} failed to start: {e}", driver.kind());
            }
        }
    }

    pub async fn stop_all(&self) {
        for driver in &self.drivers {
            driver.stop().await;
        }
    }
}

/// Shared relay-record construction for mirror and sync paths.
pub(crate) fn relay_record(message: &Message) -> MessageRecord {
    MessageRecord {
        message_id: message.id.clone(),
        sender_id: message.sender_id.clone(),
        receiver_id: message.receiver_id.clone(),
        content: message.content.clone(),
        status: message.status.as_str().to_string(),
        hops: message.hops.clone(),
        created_at: message.timestamp,
    }
}

// ── Handle (app-facing API) ──────────────────────────────────────────

/// Handle to a running mesh node. Cheap to clone; all methods are
/// channel sends.
#[derive(Clone)]
pub struct MeshHandle {
    cmd_tx: mpsc::Sender<MeshCommand>,
    local_id: NodeId,
    local_name: String,
}

impl MeshHandle {
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Submit a message for delivery. Returns the message id; delivery
    /// progress arrives as `MessageStatusChanged` events.
    pub async fn send_message(
        &self,
        content: &str,
        receiver_id: NodeId,
    ) -> Result<String, WeftError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::SendMessage {
                content: content.to_string(),
                receiver_id,
                reply,
            })
            .await
            .map_err(|_| WeftError::Shutdown)?;
        rx.await.map_err(|_| WeftError::Shutdown)?
    }

    pub async fn set_device_name(&self, name: &str) {
        let _ = self
            .cmd_tx
            .send(MeshCommand::SetDeviceName {
                name: name.to_string(),
            })
            .await;
    }

    pub async fn start_scanning(&self) {
        let _ = self.cmd_tx.send(MeshCommand::StartScanning).await;
    }

    pub async fn stop_scanning(&self) {
        let _ = self.cmd_tx.send(MeshCommand::StopScanning).await;
    }

    pub async fn send_typing_indicator(&self, receiver_id: NodeId, is_typing: bool) {
        let _ = self
            .cmd_tx
            .send(MeshCommand::SendTyping {
                receiver_id,
                is_typing,
            })
            .await;
    }

    /// Nudge a stuck message. `true` if a re-emission was scheduled.
    pub async fn retry_message(&self, message_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MeshCommand::RetryMessage {
                message_id: message_id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// The merged device view.
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MeshCommand::GetDevices { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stored conversation with a peer, oldest first.
    pub async fn conversation_with(&self, peer: NodeId) -> Vec<Message> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MeshCommand::GetConversation { with: peer, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown: flushes the offline presence update, stops
    /// the drivers, cancels the retry timers.
    pub async fn cleanup(&self) {
        let _ = self.cmd_tx.send(MeshCommand::Shutdown).await;
    }
}

// ── Node facade ──────────────────────────────────────────────────────

/// What `initialize` hands back to the application.
pub struct MeshChannels {
    pub handle: MeshHandle,
    pub events: mpsc::Receiver<MeshEvent>,
}

/// Entry point for running a mesh node.
pub struct MeshNode;

impl MeshNode {
    /// Full bring-up: load (or mint) the identity, construct the
    /// drivers the config calls for, start them, spawn the runtime.
    pub async fn initialize(config: MeshConfig, store: MeshStore) -> Result<MeshChannels, WeftError> {
        let store = Arc::new(store);
        let (device_id, device_name) =
            identity::load_or_create(&store, config.device_name.as_deref())?;

        let (driver_tx, driver_rx) = mpsc::channel(256);
        let descriptor = PeerDescriptor {
            id: device_id.clone(),
            name: Some(device_name.clone()),
            device_type: Some(config.device_type.as_str().to_string()),
            signal_strength: None,
        };

        let mut drivers = DriverSet::new();
        drivers.push(Arc::new(LanDriver::with_port(
            descriptor.clone(),
            config.lan_port,
            driver_tx.clone(),
        )));
        drivers.set_p2p(P2pDriver::new(
            descriptor,
            config.p2p_port,
            config.p2p_advertise.clone(),
            driver_tx.clone(),
        ));
        if let Some(addr) = &config.relay_addr {
            drivers.set_relay(RelayDriver::new(
                device_id.clone(),
                device_name.clone(),
                config.device_type.as_str().to_string(),
                addr.clone(),
                driver_tx.clone(),
            ));
        }
        drivers.start_all().await;

        Ok(Self::spawn(
            config,
            store,
            device_id,
            device_name,
            drivers,
            driver_rx,
        ))
    }

    /// Spawn the runtime over caller-supplied drivers (tests and
    /// embedders that bring their own transports). The identity must
    /// already be resolved.
    pub fn spawn(
        config: MeshConfig,
        store: Arc<MeshStore>,
        device_id: NodeId,
        device_name: String,
        drivers: DriverSet,
        driver_rx: mpsc::Receiver<weft_transport::DriverEvent>,
    ) -> MeshChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel::<MeshCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<MeshEvent>(256);

        let mut state = RuntimeState::new(device_id.clone(), device_name.clone(), config.clone());
        for kind in drivers.kinds() {
            state.register_transport(kind);
        }

        // Our own durable device record.
        let mut me = DeviceRecord::observed(
            device_id.clone(),
            TransportKind::Lan,
            crate::types::now_ms(),
        );
        me.name = device_name.clone();
        me.device_type = config.device_type;
        me.is_self = true;
        if let Err(e) = store.upsert_device(&me) {
            warn!("persisting self device record failed: {e}");
        }

        // Resume the durable pending queue.
        match store.pending_messages() {
            Ok(pending) => state.load_pending(pending),
            Err(e) => warn!("loading pending queue failed: {e}"),
        }

        let timers = r#loop::LoopTimers {
            announce_ms: config.announce_period_ms,
            sweep_ms: config.sweep_period_ms,
            retry_tick_ms: config.retry_tick_ms,
            relay_sync_ms: config.relay_sync_period_ms,
        };
        let executor = executor::Executor::new(drivers, store.clone(), event_tx);
        tokio::spawn(r#loop::runtime_loop(
            state, executor, store, timers, cmd_rx, driver_rx,
        ));

        MeshChannels {
            handle: MeshHandle {
                cmd_tx,
                local_id: device_id,
                local_name: device_name,
            },
            events: event_rx,
        }
    }
}

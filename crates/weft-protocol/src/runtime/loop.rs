//! The runtime event loop — thin orchestrator.
//!
//! Multiplexes driver events, application commands, and timers;
//! delegates all logic to `RuntimeState` and executes the resulting
//! effects via the executor. Feedback cascades (send results, inbox
//! admissions) are bounded to a few rounds per turn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;
use weft_store::MeshStore;
use weft_transport::DriverEvent;

use crate::types::{conversation_key, now_ms};

use super::executor::Executor;
use super::state::RuntimeState;
use super::MeshCommand;

/// Device eviction cadence.
const EVICT_INTERVAL: Duration = Duration::from_secs(3600);

/// Scan burst cadence (one DISCOVER per tick while scanning).
const SCAN_TICK: Duration = Duration::from_secs(1);

/// Feedback cascade bound per loop turn.
const MAX_FEEDBACK_ROUNDS: usize = 3;

pub(super) struct LoopTimers {
    pub announce_ms: u64,
    pub sweep_ms: u64,
    pub retry_tick_ms: u64,
    pub relay_sync_ms: u64,
}

pub(super) async fn runtime_loop(
    mut state: RuntimeState,
    executor: Executor,
    store: Arc<MeshStore>,
    timers: LoopTimers,
    mut cmd_rx: mpsc::Receiver<MeshCommand>,
    mut driver_rx: mpsc::Receiver<DriverEvent>,
) {
    let mut announce = tokio::time::interval(Duration::from_millis(timers.announce_ms));
    let mut sweep = tokio::time::interval(Duration::from_millis(timers.sweep_ms));
    let mut retry = tokio::time::interval(Duration::from_millis(timers.retry_tick_ms));
    let mut scan = tokio::time::interval(SCAN_TICK);
    let mut relay_sync = tokio::time::interval(Duration::from_millis(timers.relay_sync_ms));
    let mut evict = tokio::time::interval(EVICT_INTERVAL);

    // The first announce goes out immediately (the initialization
    // announce); every other timer skips its immediate tick. Eviction
    // also runs once at startup to clear ancient device records.
    sweep.tick().await;
    retry.tick().await;
    scan.tick().await;
    relay_sync.tick().await;

    loop {
        let now = now_ms();
        let effects = tokio::select! {
            Some(event) = driver_rx.recv() => state.handle_driver_event(event, now),

            Some(cmd) = cmd_rx.recv() => match cmd {
                MeshCommand::SendMessage { content, receiver_id, reply } => {
                    match state.handle_send(content, receiver_id, now) {
                        Ok((message_id, effects)) => {
                            let _ = reply.send(Ok(message_id));
                            effects
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            Vec::new()
                        }
                    }
                }
                MeshCommand::SetDeviceName { name } => {
                    if let Err(e) = store.set_device_name(&name) {
                        warn!("persisting device name failed: {e}");
                    }
                    state.handle_set_name(name)
                }
                MeshCommand::StartScanning => state.handle_scan(true),
                MeshCommand::StopScanning => state.handle_scan(false),
                MeshCommand::SendTyping { receiver_id, is_typing } => {
                    state.handle_typing(receiver_id, is_typing, now)
                }
                MeshCommand::RetryMessage { message_id, reply } => {
                    let stored = store.message(&message_id).ok().flatten();
                    let (retried, effects) = state.handle_retry(&message_id, stored, now);
                    let _ = reply.send(retried);
                    effects
                }
                MeshCommand::GetDevices { reply } => {
                    let _ = reply.send(state.devices());
                    Vec::new()
                }
                MeshCommand::GetConversation { with, reply } => {
                    let key = conversation_key(state.local_id(), &with);
                    let _ = reply.send(store.conversation(&key).unwrap_or_default());
                    Vec::new()
                }
                MeshCommand::Shutdown => break,
            },

            _ = announce.tick() => state.tick_announce(now),
            _ = sweep.tick() => state.tick_sweep(now),
            _ = retry.tick() => state.tick_retry(now),
            _ = scan.tick() => state.tick_scan(now),
            _ = relay_sync.tick() => state.tick_relay_sync(now),
            _ = evict.tick() => state.tick_evict(now),

            else => break,
        };

        let mut feedback = executor.execute(effects).await;
        for _ in 0..MAX_FEEDBACK_ROUNDS {
            if feedback.is_empty() {
                break;
            }
            let mut follow_ups = Vec::new();
            for item in feedback.drain(..) {
                follow_ups.extend(state.handle_feedback(item, now_ms()));
            }
            feedback = executor.execute(follow_ups).await;
        }
    }

    // Graceful shutdown: best-effort offline flush, then tear the
    // drivers down. Pending retries die with the loop.
    let _ = executor.execute(state.shutdown_effects()).await;
    executor.stop_drivers().await;
}

//! Pending-retry table: the at-least-once delivery bookkeeping.
//!
//! One entry per MESSAGE packet that has been emitted (or queued) and
//! not yet acknowledged. The runtime's retry tick asks for due
//! entries; an ACK removes the entry; exhausting the budget turns the
//! message `failed`. Pure logic — timers live in the runtime loop.

use std::collections::HashMap;

use crate::packet::Packet;
use crate::types::Message;

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before attempt `retries + 1`: `min(base × factor^retries, cap)`.
    pub fn backoff_ms(&self, retries: u32) -> u64 {
        let raw = self.base_ms as f64 * self.factor.powi(retries as i32);
        (raw as u64).min(self.cap_ms)
    }
}

/// One unacknowledged message.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub message: Message,
    pub packet: Packet,
    pub retries: u32,
    /// Unix ms of the most recent emission attempt.
    pub last_attempt: u64,
    /// Unix ms when the retry timer fires.
    pub next_due: u64,
}

/// Outcome of a retry-timer fire for one entry.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Re-emit the packet; the timer has been re-armed.
    Retry { packet: Packet, retries: u32 },
    /// Budget exhausted; the entry is gone and the message is failed.
    Exhausted { message: Message },
}

/// In-memory pending-retry table, keyed by packet id.
pub struct PendingTable {
    entries: HashMap<String, PendingEntry>,
    policy: RetryPolicy,
}

impl PendingTable {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
        }
    }

    /// Track a freshly emitted (or queued) message.
    pub fn register(&mut self, message: Message, packet: Packet, now: u64) {
        let next_due = now + self.policy.backoff_ms(0);
        self.entries.insert(
            packet.id.clone(),
            PendingEntry {
                message,
                packet,
                retries: 0,
                last_attempt: now,
                next_due,
            },
        );
    }

    /// Restore an entry from the durable queue after a restart.
    pub fn restore(&mut self, message: Message, packet: Packet, retries: u32, last_attempt: u64) {
        let next_due = last_attempt + self.policy.backoff_ms(retries);
        self.entries.insert(
            packet.id.clone(),
            PendingEntry {
                message,
                packet,
                retries,
                last_attempt,
                next_due,
            },
        );
    }

    /// ACK correlation: remove and return the entry for `packet_id`.
    pub fn acknowledge(&mut self, packet_id: &str) -> Option<PendingEntry> {
        self.entries.remove(packet_id)
    }

    /// Ids whose retry timer has fired.
    pub fn due(&self, now: u64) -> Vec<String> {
        let mut due: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_due <= now)
            .map(|(id, e)| (e.next_due, id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// The timer fired for `packet_id`: bump the retry count, re-arm,
    /// and report whether to re-emit or give up.
    pub fn record_attempt(&mut self, packet_id: &str, now: u64) -> Option<RetryOutcome> {
        let entry = self.entries.get_mut(packet_id)?;
        entry.retries += 1;
        entry.message.retry_count = entry.retries;
        if entry.retries >= self.policy.max_retries {
            let entry = self.entries.remove(packet_id).expect("entry just seen");
            return Some(RetryOutcome::Exhausted {
                message: entry.message,
            });
        }
        entry.last_attempt = now;
        entry.next_due = now + self.policy.backoff_ms(entry.retries);
        Some(RetryOutcome::Retry {
            packet: entry.packet.clone(),
            retries: entry.retries,
        })
    }

    /// Entries eligible for the reconnect drain: last attempted before
    /// `now − floor_ms` (avoids a thundering herd on flappy links).
    pub fn drain_candidates(&self, now: u64, floor_ms: u64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_attempt) >= floor_ms)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Note a re-emission that does not consume retry budget (drain
    /// and explicit user retry). Re-arms the timer from `now`.
    pub fn touch_attempt(&mut self, packet_id: &str, now: u64) -> Option<&PendingEntry> {
        let entry = self.entries.get_mut(packet_id)?;
        entry.last_attempt = now;
        entry.next_due = now + self.policy.backoff_ms(entry.retries);
        Some(&*entry)
    }

    /// Make an entry due immediately (explicit user retry / drain).
    pub fn make_due(&mut self, packet_id: &str, now: u64) -> bool {
        match self.entries.get_mut(packet_id) {
            Some(entry) => {
                entry.next_due = now;
                true
            }
            None => false,
        }
    }

    /// Track a status transition on the in-flight message copy.
    pub fn set_message_status(&mut self, packet_id: &str, status: crate::types::MessageStatus) {
        if let Some(entry) = self.entries.get_mut(packet_id) {
            entry.message.status = status;
        }
    }

    pub fn get(&self, packet_id: &str) -> Option<&PendingEntry> {
        self.entries.get(packet_id)
    }

    pub fn contains(&self, packet_id: &str) -> bool {
        self.entries.contains_key(packet_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageStatus, NodeId};

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_ms: 2000,
            factor: 1.5,
            cap_ms: 60_000,
            max_retries: 20,
        }
    }

    fn sample(now: u64) -> (Message, Packet) {
        let from = node("AAAA1111");
        let to = node("BBBB2222");
        let packet = Packet::message(&from, to.clone(), "content".into(), 10);
        let message = Message {
            id: packet.id.clone(),
            content: "content".into(),
            sender_id: from.clone(),
            receiver_id: to,
            timestamp: now,
            hops: vec![from],
            status: MessageStatus::Sending,
            retry_count: 0,
        };
        (message, packet)
    }

    #[test]
    fn backoff_schedule() {
        let policy = policy();
        assert_eq!(policy.backoff_ms(0), 2000);
        assert_eq!(policy.backoff_ms(1), 3000);
        assert_eq!(policy.backoff_ms(2), 4500);
        // Deep retries hit the cap.
        assert_eq!(policy.backoff_ms(15), 60_000);
    }

    #[test]
    fn register_due_acknowledge() {
        let mut table = PendingTable::new(policy());
        let (message, packet) = sample(1000);
        let id = packet.id.clone();
        table.register(message, packet, 1000);

        assert!(table.contains(&id));
        assert!(table.due(2000).is_empty()); // first backoff is 2000ms
        assert_eq!(table.due(3001), vec![id.clone()]);

        let entry = table.acknowledge(&id).unwrap();
        assert_eq!(entry.retries, 0);
        assert!(table.is_empty());
        assert!(table.acknowledge(&id).is_none());
    }

    #[test]
    fn retry_increments_and_rearms() {
        let mut table = PendingTable::new(policy());
        let (message, packet) = sample(0);
        let id = packet.id.clone();
        table.register(message, packet, 0);

        match table.record_attempt(&id, 2000).unwrap() {
            RetryOutcome::Retry { retries, packet } => {
                assert_eq!(retries, 1);
                assert!(packet.verify());
            }
            other => panic!("expected Retry, got {other:?}"),
        }
        let entry = table.get(&id).unwrap();
        assert_eq!(entry.last_attempt, 2000);
        assert_eq!(entry.next_due, 2000 + 3000); // base × 1.5¹
    }

    #[test]
    fn budget_exhaustion_removes_entry() {
        let mut table = PendingTable::new(RetryPolicy {
            max_retries: 3,
            ..policy()
        });
        let (message, packet) = sample(0);
        let id = packet.id.clone();
        table.register(message, packet, 0);

        assert!(matches!(
            table.record_attempt(&id, 1000),
            Some(RetryOutcome::Retry { retries: 1, .. })
        ));
        assert!(matches!(
            table.record_attempt(&id, 2000),
            Some(RetryOutcome::Retry { retries: 2, .. })
        ));
        match table.record_attempt(&id, 3000) {
            Some(RetryOutcome::Exhausted { message }) => {
                assert_eq!(message.id, id);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert!(!table.contains(&id));
        assert!(table.record_attempt(&id, 4000).is_none());
    }

    #[test]
    fn retries_never_exceed_budget() {
        let max = 5;
        let mut table = PendingTable::new(RetryPolicy {
            max_retries: max,
            ..policy()
        });
        let (message, packet) = sample(0);
        let id = packet.id.clone();
        table.register(message, packet, 0);

        let mut attempts = 0;
        while let Some(outcome) = table.record_attempt(&id, attempts * 1000) {
            attempts += 1;
            if let RetryOutcome::Retry { retries, .. } = outcome {
                assert!(retries < max);
            }
        }
        assert_eq!(attempts as u32, max);
    }

    #[test]
    fn drain_candidates_respect_floor() {
        let mut table = PendingTable::new(policy());
        let (m1, p1) = sample(0);
        let (m2, p2) = sample(0);
        let fresh_id = p2.id.clone();
        let stale_id = p1.id.clone();
        table.register(m1, p1, 0);
        table.register(m2, p2, 9_000);

        let candidates = table.drain_candidates(15_000, 10_000);
        assert_eq!(candidates, vec![stale_id.clone()]);
        assert!(!candidates.contains(&fresh_id));

        assert!(table.make_due(&stale_id, 15_000));
        assert!(table.due(15_000).contains(&stale_id));
        assert!(!table.make_due("no-such-entry", 15_000));
    }

    #[test]
    fn restore_resumes_schedule() {
        let mut table = PendingTable::new(policy());
        let (message, packet) = sample(0);
        let id = packet.id.clone();
        table.restore(message, packet, 4, 100_000);

        let entry = table.get(&id).unwrap();
        assert_eq!(entry.retries, 4);
        // next_due = last_attempt + base × 1.5⁴ = 100000 + 10125
        assert_eq!(entry.next_due, 110_125);
    }
}

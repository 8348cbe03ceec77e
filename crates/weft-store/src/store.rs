//! SQLite-backed store. Schema is created on open; every method takes
//! the connection mutex for the duration of one statement, so writes
//! are single-writer per key as the runtime expects.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use weft_transport::{NodeId, TransportKind};

use crate::error::StoreError;
use crate::records::{DeviceRecord, DeviceType, Message, MessageStatus, PendingMessage};

/// Durable local store for one node.
pub struct MeshStore {
    conn: Mutex<Connection>,
}

impl MeshStore {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Ephemeral in-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identity (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS devices (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                device_type     TEXT NOT NULL,
                signal_strength INTEGER NOT NULL,
                distance        REAL NOT NULL,
                angle           REAL NOT NULL,
                is_connected    INTEGER NOT NULL,
                is_online       INTEGER NOT NULL,
                last_seen       INTEGER NOT NULL,
                connection_type TEXT NOT NULL,
                is_self         INTEGER NOT NULL,
                is_typing       INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id               TEXT PRIMARY KEY,
                conversation_key TEXT NOT NULL,
                content          TEXT NOT NULL,
                sender_id        TEXT NOT NULL,
                receiver_id      TEXT NOT NULL,
                timestamp        INTEGER NOT NULL,
                hops             TEXT NOT NULL,
                status           TEXT NOT NULL,
                retry_count      INTEGER NOT NULL,
                synced           INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_key);
            CREATE INDEX IF NOT EXISTS idx_messages_synced
                ON messages(synced);
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp
                ON messages(timestamp);
            CREATE TABLE IF NOT EXISTS pending_messages (
                id           TEXT PRIMARY KEY,
                message      TEXT NOT NULL,
                retries      INTEGER NOT NULL,
                last_attempt INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_retries
                ON pending_messages(retries);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Identity ───────────────────────────────────────────────────────

    /// The persisted node identity, if one was ever saved.
    pub fn load_identity(&self) -> Result<Option<(NodeId, String)>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let id: Option<String> = conn
            .query_row(
                "SELECT value FROM identity WHERE key = 'device_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let name: Option<String> = conn
            .query_row(
                "SELECT value FROM identity WHERE key = 'device_name'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match (id, name) {
            (Some(id), Some(name)) => {
                let id = NodeId::from_str(&id).map_err(|_| StoreError::InvalidValue {
                    field: "device_id",
                    value: id,
                })?;
                Ok(Some((id, name)))
            }
            _ => Ok(None),
        }
    }

    pub fn save_identity(&self, id: &NodeId, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO identity (key, value) VALUES ('device_id', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![id.as_str()],
        )?;
        conn.execute(
            "INSERT INTO identity (key, value) VALUES ('device_name', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![name],
        )?;
        Ok(())
    }

    pub fn set_device_name(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO identity (key, value) VALUES ('device_name', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![name],
        )?;
        Ok(())
    }

    // ── Config ─────────────────────────────────────────────────────────

    pub fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        Ok(conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ── Devices ────────────────────────────────────────────────────────

    pub fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO devices (id, name, device_type, signal_strength, distance, angle,
                                  is_connected, is_online, last_seen, connection_type,
                                  is_self, is_typing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                device_type = excluded.device_type,
                signal_strength = excluded.signal_strength,
                distance = excluded.distance,
                angle = excluded.angle,
                is_connected = excluded.is_connected,
                is_online = excluded.is_online,
                last_seen = excluded.last_seen,
                connection_type = excluded.connection_type,
                is_self = excluded.is_self,
                is_typing = excluded.is_typing",
            params![
                device.id.as_str(),
                device.name,
                device.device_type.as_str(),
                device.signal_strength,
                device.distance,
                device.angle,
                device.is_connected,
                device.is_online,
                device.last_seen,
                device.connection_type.as_str(),
                device.is_self,
                device.is_typing,
            ],
        )?;
        Ok(())
    }

    pub fn device(&self, id: &NodeId) -> Result<Option<DeviceRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let row = conn
            .query_row(
                "SELECT id, name, device_type, signal_strength, distance, angle,
                        is_connected, is_online, last_seen, connection_type, is_self, is_typing
                 FROM devices WHERE id = ?1",
                [id.as_str()],
                device_from_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, name, device_type, signal_strength, distance, angle,
                    is_connected, is_online, last_seen, connection_type, is_self, is_typing
             FROM devices ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], device_from_row)?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row??);
        }
        Ok(devices)
    }

    /// Age-based eviction: remove devices not seen since `cutoff_ms`.
    /// Returns the number of evicted records.
    pub fn evict_devices_older_than(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let n = conn.execute(
            "DELETE FROM devices WHERE last_seen < ?1 AND is_self = 0",
            params![cutoff_ms],
        )?;
        if n > 0 {
            debug!("store: evicted {n} stale device records");
        }
        Ok(n)
    }

    // ── Messages ───────────────────────────────────────────────────────

    pub fn insert_message(&self, message: &Message, synced: bool) -> Result<(), StoreError> {
        let hops = serde_json::to_string(&message.hops)?;
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO messages (id, conversation_key, content, sender_id, receiver_id,
                                   timestamp, hops, status, retry_count, synced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO NOTHING",
            params![
                message.id,
                message.conversation_key(),
                message.content,
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.timestamp,
                hops,
                message.status.as_str(),
                message.retry_count,
                synced,
            ],
        )?;
        Ok(())
    }

    /// The duplicate-delivery gate consulted by the routing engine.
    pub fn message_exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM messages WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let row = conn
            .query_row(
                "SELECT id, content, sender_id, receiver_id, timestamp, hops, status, retry_count
                 FROM messages WHERE id = ?1",
                [id],
                message_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Returns `true` if the message existed.
    pub fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let n = conn.execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn update_message_retries(&self, id: &str, retry_count: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE messages SET retry_count = ?2 WHERE id = ?1",
            params![id, retry_count],
        )?;
        Ok(())
    }

    /// All messages of one conversation, oldest first.
    pub fn conversation(&self, key: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, content, sender_id, receiver_id, timestamp, hops, status, retry_count
             FROM messages WHERE conversation_key = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([key], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        Ok(messages)
    }

    /// Messages not yet mirrored to the rendezvous relay.
    pub fn unsynced_messages(&self) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, content, sender_id, receiver_id, timestamp, hops, status, retry_count
             FROM messages WHERE synced = 0 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        Ok(messages)
    }

    pub fn mark_synced(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute("UPDATE messages SET synced = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    // ── Pending-retry queue ────────────────────────────────────────────

    pub fn enqueue_pending(&self, pending: &PendingMessage) -> Result<(), StoreError> {
        let message = serde_json::to_string(&pending.message)?;
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO pending_messages (id, message, retries, last_attempt)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                message = excluded.message,
                retries = excluded.retries,
                last_attempt = excluded.last_attempt",
            params![pending.id, message, pending.retries, pending.last_attempt],
        )?;
        Ok(())
    }

    pub fn pending_messages(&self) -> Result<Vec<PendingMessage>, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT id, message, retries, last_attempt
             FROM pending_messages ORDER BY retries ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u64>(3)?,
            ))
        })?;
        let mut pending = Vec::new();
        for row in rows {
            let (id, message, retries, last_attempt) = row?;
            pending.push(PendingMessage {
                id,
                message: serde_json::from_str(&message)?,
                retries,
                last_attempt,
            });
        }
        Ok(pending)
    }

    pub fn update_pending(&self, id: &str, retries: u32, last_attempt: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE pending_messages SET retries = ?2, last_attempt = ?3 WHERE id = ?1",
            params![id, retries, last_attempt],
        )?;
        Ok(())
    }

    /// Returns `true` if an entry was removed.
    pub fn remove_pending(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let n = conn.execute("DELETE FROM pending_messages WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}

type RowResult<T> = rusqlite::Result<Result<T, StoreError>>;

fn device_from_row(row: &rusqlite::Row<'_>) -> RowResult<DeviceRecord> {
    let id: String = row.get(0)?;
    let device_type: String = row.get(2)?;
    let connection_type: String = row.get(9)?;
    Ok((|| {
        Ok(DeviceRecord {
            id: NodeId::from_str(&id).map_err(|_| StoreError::InvalidValue {
                field: "device_id",
                value: id.clone(),
            })?,
            name: row_get(row, 1)?,
            device_type: DeviceType::parse_lossy(&device_type),
            signal_strength: row_get(row, 3)?,
            distance: row_get(row, 4)?,
            angle: row_get(row, 5)?,
            is_connected: row_get(row, 6)?,
            is_online: row_get(row, 7)?,
            last_seen: row_get(row, 8)?,
            connection_type: TransportKind::from_str(&connection_type).map_err(|_| {
                StoreError::InvalidValue {
                    field: "connection_type",
                    value: connection_type.clone(),
                }
            })?,
            is_self: row_get(row, 10)?,
            is_typing: row_get(row, 11)?,
        })
    })())
}

fn message_from_row(row: &rusqlite::Row<'_>) -> RowResult<Message> {
    let sender: String = row.get(2)?;
    let receiver: String = row.get(3)?;
    let hops: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok((|| {
        Ok(Message {
            id: row_get(row, 0)?,
            content: row_get(row, 1)?,
            sender_id: NodeId::from_str(&sender).map_err(|_| StoreError::InvalidValue {
                field: "sender_id",
                value: sender.clone(),
            })?,
            receiver_id: NodeId::from_str(&receiver).map_err(|_| StoreError::InvalidValue {
                field: "receiver_id",
                value: receiver.clone(),
            })?,
            timestamp: row_get(row, 4)?,
            hops: serde_json::from_str(&hops)?,
            status: status.parse()?,
            retry_count: row_get(row, 7)?,
        })
    })())
}

fn row_get<T: rusqlite::types::FromSql>(row: &rusqlite::Row<'_>, idx: usize) -> Result<T, StoreError> {
    Ok(row.get(idx)?)
}

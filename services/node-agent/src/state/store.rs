//! SQLite-based state store for node agent.
//!
//! This provides durable storage for machine instance records and for
//! lifecycle events awaiting upstream delivery, enabling recovery after
//! agent restarts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_events::MachineEvent;
use fleet_id::{EventId, MachineId};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::machine::{Machine, MachineInstanceState, MachineVersion};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Machine {0} already exists")]
    AlreadyExists(MachineId),
}

/// Everything persisted about one machine on this node.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRecord {
    pub machine: Machine,
    pub version: MachineVersion,
    pub state: MachineInstanceState,
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                machine_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                status TEXT NOT NULL,
                machine_json TEXT NOT NULL,
                version_json TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS machine_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                machine_id TEXT NOT NULL,
                event_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_machine_events_machine ON machine_events(machine_id);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert the record of a newly placed machine.
    pub fn create_machine_instance(&self, record: &MachineRecord) -> Result<(), StateStoreError> {
        let inserted = self.conn().execute(
            r#"
            INSERT OR IGNORE INTO machines (machine_id, instance_id, status, machine_json, version_json, state_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.machine.id.to_string(),
                record.machine.instance_id.to_string(),
                record.state.status().as_str(),
                serde_json::to_string(&record.machine)?,
                serde_json::to_string(&record.version)?,
                serde_json::to_string(&record.state)?,
                record.state.created_at.timestamp_millis(),
                record.state.updated_at.timestamp_millis(),
            ],
        )?;

        if inserted == 0 {
            return Err(StateStoreError::AlreadyExists(record.machine.id));
        }
        Ok(())
    }

    /// Get one machine record.
    pub fn get_machine_instance(
        &self,
        machine_id: MachineId,
    ) -> Result<Option<MachineRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT machine_json, version_json, state_json FROM machines WHERE machine_id = ?1",
        )?;

        let row = stmt
            .query_row(params![machine_id.to_string()], read_record_columns)
            .optional()?;

        row.map(decode_record).transpose()
    }

    /// Load every machine record, oldest first.
    pub fn load_machine_instances(&self) -> Result<Vec<MachineRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT machine_json, version_json, state_json FROM machines ORDER BY created_at, machine_id",
        )?;

        let rows = stmt
            .query_map([], read_record_columns)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(decode_record).collect()
    }

    /// Replace the instance state of a machine.
    pub fn update_machine_instance_state(
        &self,
        machine_id: MachineId,
        state: &MachineInstanceState,
    ) -> Result<(), StateStoreError> {
        update_state(&self.conn(), machine_id, state)
    }

    /// Persist a committed transition: the new state and its event, atomically.
    pub fn persist_transition(
        &self,
        machine_id: MachineId,
        state: &MachineInstanceState,
        event: &MachineEvent,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        update_state(&tx, machine_id, state)?;
        insert_event(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a machine record.
    pub fn delete_machine_instance(&self, machine_id: MachineId) -> Result<(), StateStoreError> {
        self.conn().execute(
            "DELETE FROM machines WHERE machine_id = ?1",
            params![machine_id.to_string()],
        )?;
        Ok(())
    }

    /// Store an event awaiting delivery. Storing the same event twice is a no-op.
    pub fn put_machine_instance_event(&self, event: &MachineEvent) -> Result<(), StateStoreError> {
        insert_event(&self.conn(), event)
    }

    /// Remove an acknowledged event.
    pub fn delete_machine_instance_event(&self, event_id: EventId) -> Result<(), StateStoreError> {
        self.conn().execute(
            "DELETE FROM machine_events WHERE event_id = ?1",
            params![event_id.to_string()],
        )?;
        Ok(())
    }

    /// Load every event awaiting delivery, in the order they were stored.
    pub fn load_machine_instance_events(&self) -> Result<Vec<MachineEvent>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT event_json FROM machine_events ORDER BY seq")?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    /// Count events awaiting delivery.
    pub fn count_machine_instance_events(&self) -> Result<i64, StateStoreError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM machine_events", [], |row| row.get(0))?;
        Ok(count)
    }
}

type RecordColumns = (String, String, String);

fn read_record_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_record(
    (machine, version, state): RecordColumns,
) -> Result<MachineRecord, StateStoreError> {
    Ok(MachineRecord {
        machine: serde_json::from_str(&machine)?,
        version: serde_json::from_str(&version)?,
        state: serde_json::from_str(&state)?,
    })
}

fn update_state(
    conn: &Connection,
    machine_id: MachineId,
    state: &MachineInstanceState,
) -> Result<(), StateStoreError> {
    let updated = conn.execute(
        "UPDATE machines SET status = ?1, state_json = ?2, updated_at = ?3 WHERE machine_id = ?4",
        params![
            state.status().as_str(),
            serde_json::to_string(state)?,
            state.updated_at.timestamp_millis(),
            machine_id.to_string(),
        ],
    )?;

    if updated == 0 {
        return Err(StateStoreError::NotFound(format!("machine {machine_id}")));
    }
    Ok(())
}

fn insert_event(conn: &Connection, event: &MachineEvent) -> Result<(), StateStoreError> {
    conn.execute(
        r#"
        INSERT OR IGNORE INTO machine_events (event_id, machine_id, event_json, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            event.id().to_string(),
            event.machine_id().to_string(),
            serde_json::to_string(event)?,
            event.timestamp().timestamp_millis(),
        ],
    )?;
    Ok(())
}

//! Per-server connection state owned by the manager.
//!
//! Each server id maps to one [`Slot`]. The slot's lifecycle lock serializes
//! connect and disconnect for that id; every status change goes through the
//! record lock and is checked against the attempt `generation`, so a stale
//! monitor or a failed call from an earlier session never overwrites a newer
//! one.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::McpError;
use crate::mcp::session::Session;
use crate::mcp::types::{ConnectionSnapshot, ConnectionStatus, ServerDefinition};

pub(crate) struct ConnectionRecord {
    id: String,
    name: String,
    status: ConnectionStatus,
    last_connected: Option<DateTime<Utc>>,
    failure: Option<McpError>,
    generation: Uuid,
    operation_timeout: Duration,
    session: Option<Arc<Session>>,
    monitor: Option<JoinHandle<()>>,
}

impl ConnectionRecord {
    fn new(definition: &ServerDefinition, operation_timeout: Duration) -> Self {
        Self {
            id: definition.id.clone(),
            name: if definition.name.is_empty() {
                definition.id.clone()
            } else {
                definition.name.clone()
            },
            status: ConnectionStatus::Disconnected,
            last_connected: None,
            failure: None,
            generation: Uuid::nil(),
            operation_timeout,
            session: None,
            monitor: None,
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            last_connected: self.last_connected,
            last_error: self.failure.as_ref().map(McpError::to_string),
        }
    }

    fn take_resources(&mut self) -> Teardown {
        Teardown {
            server_id: self.id.clone(),
            session: self.session.take(),
            monitor: self.monitor.take(),
        }
    }
}

/// Resources released from a record that still need closing.
pub(crate) struct Teardown {
    server_id: String,
    session: Option<Arc<Session>>,
    monitor: Option<JoinHandle<()>>,
}

impl Teardown {
    /// Closes a session that never made it into a record.
    pub fn session(server_id: impl Into<String>, session: Arc<Session>) -> Self {
        Self {
            server_id: server_id.into(),
            session: Some(session),
            monitor: None,
        }
    }

    /// Lets the monitor task tear down its own record without aborting itself.
    pub fn detach_monitor(mut self) -> Self {
        self.monitor = None;
        self
    }

    /// Stops the monitor, then closes the session within `limit`. Failures are
    /// logged only; teardown always completes.
    pub async fn run(self, limit: Duration) {
        if let Some(monitor) = self.monitor {
            monitor.abort();
        }
        let Some(session) = self.session else {
            return;
        };
        match tokio::time::timeout(limit, session.close()).await {
            Ok(Ok(())) => debug!(server = %self.server_id, "Session closed"),
            Ok(Err(e)) => warn!(server = %self.server_id, "Error closing session: {}", e),
            Err(_) => warn!(server = %self.server_id, "Closing session timed out after {:?}", limit),
        }
    }
}

/// Live session of a connected record, as handed to an operation call.
pub(crate) struct ActiveSession {
    pub session: Arc<Session>,
    pub generation: Uuid,
    pub operation_timeout: Duration,
}

pub(crate) struct Slot {
    lifecycle: Arc<Mutex<()>>,
    record: RwLock<Option<ConnectionRecord>>,
    retired: AtomicBool,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(Mutex::new(())),
            record: RwLock::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub async fn lock_lifecycle(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lifecycle).lock_owned().await
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<ConnectionSnapshot> {
        self.record.read().as_ref().map(ConnectionRecord::snapshot)
    }

    pub fn connected_snapshot(&self) -> Option<ConnectionSnapshot> {
        self.record
            .read()
            .as_ref()
            .filter(|r| r.status == ConnectionStatus::Connected)
            .map(ConnectionRecord::snapshot)
    }

    pub fn active_session(&self) -> Option<ActiveSession> {
        let record = self.record.read();
        let record = record.as_ref()?;
        if record.status != ConnectionStatus::Connected {
            return None;
        }
        record.session.as_ref().map(|session| ActiveSession {
            session: Arc::clone(session),
            generation: record.generation,
            operation_timeout: record.operation_timeout,
        })
    }

    /// Still connected under the given attempt.
    pub fn is_current(&self, generation: Uuid) -> bool {
        self.record
            .read()
            .as_ref()
            .is_some_and(|r| r.generation == generation && r.status == ConnectionStatus::Connected)
    }

    /// Generation of the attempt currently in flight, if any.
    pub fn pending_attempt(&self) -> Option<Uuid> {
        self.record
            .read()
            .as_ref()
            .filter(|r| r.status == ConnectionStatus::Connecting)
            .map(|r| r.generation)
    }

    /// The error that ended `generation`, once it has failed.
    pub fn failure_of(&self, generation: Uuid) -> Option<McpError> {
        self.record
            .read()
            .as_ref()
            .filter(|r| r.generation == generation && r.status == ConnectionStatus::Error)
            .and_then(|r| r.failure.clone())
    }

    /// Starts a new attempt, replacing whatever record was there. The
    /// previous record's leftovers are returned for closing.
    pub fn begin_connecting(
        &self,
        definition: &ServerDefinition,
        operation_timeout: Duration,
        generation: Uuid,
    ) -> Option<Teardown> {
        let mut guard = self.record.write();
        let stale = guard.as_mut().map(ConnectionRecord::take_resources);

        let mut record = ConnectionRecord::new(definition, operation_timeout);
        if let Some(previous) = guard.as_ref() {
            record.last_connected = previous.last_connected;
        }
        record.status = ConnectionStatus::Connecting;
        record.generation = generation;
        *guard = Some(record);
        stale
    }

    pub fn mark_connected(
        &self,
        generation: Uuid,
        session: Arc<Session>,
        at: DateTime<Utc>,
        monitor: Option<JoinHandle<()>>,
    ) -> Option<ConnectionSnapshot> {
        let mut guard = self.record.write();
        let record = guard.as_mut().filter(|r| r.generation == generation)?;
        record.status = ConnectionStatus::Connected;
        record.last_connected = Some(at);
        record.failure = None;
        record.session = Some(session);
        record.monitor = monitor;
        Some(record.snapshot())
    }

    /// Flips the record to `error` if it still belongs to `generation` and
    /// has not already failed. Returns what must be closed.
    pub fn fail(&self, generation: Uuid, error: McpError) -> Option<Teardown> {
        let mut guard = self.record.write();
        let record = guard
            .as_mut()
            .filter(|r| r.generation == generation && r.status != ConnectionStatus::Error)?;
        record.status = ConnectionStatus::Error;
        record.failure = Some(error);
        Some(record.take_resources())
    }

    /// Removes the record for good; later lookups through this slot see nothing.
    pub fn retire(&self) -> Option<Teardown> {
        self.retired.store(true, Ordering::SeqCst);
        let mut record = self.record.write().take()?;
        record.status = ConnectionStatus::Disconnected;
        Some(record.take_resources())
    }
}

use futures::future::join_all;
use mockable::{Clock, DefaultClock};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::McpError;
use crate::mcp::connection::{Slot, Teardown};
use crate::mcp::deadline::Deadline;
use crate::mcp::monitor::{spawn_monitor, MonitorPolicy};
use crate::mcp::session::Session;
use crate::mcp::transport::{DefaultTransportFactory, TransportFactory};
use crate::mcp::types::{
    CapabilityCounts, ConnectionSnapshot, ConnectionStatus, HealthCheck, HealthReport, McpPrompt,
    McpResource, McpTool, ProbeReport, ServerDefinition, ServerIdentity,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Bounds transport open, `initialize` and the first tool listing.
    pub connect_timeout: Duration,
    /// Default bound for each later call; a definition's `timeout` overrides it.
    pub operation_timeout: Duration,
    pub monitor: MonitorPolicy,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            monitor: MonitorPolicy::default(),
        }
    }
}

/// Registry of server connections and the single entry point for using them.
///
/// Connections to different servers proceed independently; connect and
/// disconnect for the same server id are serialized.
pub struct McpManager {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    factory: Arc<dyn TransportFactory>,
    clock: Arc<dyn Clock + Send + Sync>,
    settings: ManagerSettings,
}

/// Settles one connect attempt. If the attempt is dropped before it settles,
/// the record is marked failed and any session built so far is closed.
struct ConnectAttempt {
    slot: Arc<Slot>,
    server_id: String,
    generation: Uuid,
    close_limit: Duration,
    session: Option<Arc<Session>>,
    armed: bool,
}

impl ConnectAttempt {
    fn new(slot: Arc<Slot>, server_id: &str, generation: Uuid, close_limit: Duration) -> Self {
        Self {
            slot,
            server_id: server_id.to_string(),
            generation,
            close_limit,
            session: None,
            armed: true,
        }
    }

    fn attach(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    fn finish(mut self) {
        self.armed = false;
        self.session = None;
    }

    /// Flips the record to `error` before anything is awaited, then closes
    /// the session within the close limit.
    async fn fail(mut self, error: McpError) -> McpError {
        self.armed = false;
        let stale = self.slot.fail(self.generation, error.clone());
        let session = self.session.take();
        if let Some(stale) = stale {
            stale.run(self.close_limit).await;
        }
        if let Some(session) = session {
            Teardown::session(self.server_id.as_str(), session)
                .run(self.close_limit)
                .await;
        }
        error
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(server = %self.server_id, "Connection attempt cancelled");
        let stale = self.slot.fail(self.generation, McpError::Cancelled);
        let session = self.session.take();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server_id = self.server_id.clone();
        let limit = self.close_limit;
        runtime.spawn(async move {
            if let Some(stale) = stale {
                stale.run(limit).await;
            }
            if let Some(session) = session {
                Teardown::session(server_id, session).run(limit).await;
            }
        });
    }
}

impl McpManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self::with_dependencies(
            settings,
            Arc::new(DefaultTransportFactory::new()),
            Arc::new(DefaultClock),
        )
    }

    pub fn with_dependencies(
        settings: ManagerSettings,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            factory,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots.read().get(id).cloned()
    }

    /// Returns the live slot for `id`, creating it if needed, with its
    /// lifecycle lock held. A slot retired while we waited is skipped.
    ///
    /// Also returns the generation of the attempt that was in flight when we
    /// arrived, so a waiter can report that attempt's outcome.
    async fn claim_slot(&self, id: &str) -> (Arc<Slot>, OwnedMutexGuard<()>, Option<Uuid>) {
        loop {
            let slot = {
                let mut slots = self.slots.write();
                Arc::clone(
                    slots
                        .entry(id.to_string())
                        .or_insert_with(|| Arc::new(Slot::new())),
                )
            };
            let awaited = slot.pending_attempt();
            let guard = slot.lock_lifecycle().await;
            if !slot.is_retired() {
                return (slot, guard, awaited);
            }
        }
    }

    pub async fn connect(
        &self,
        definition: &ServerDefinition,
    ) -> Result<ConnectionSnapshot, McpError> {
        let (slot, _lifecycle, awaited) = self.claim_slot(&definition.id).await;

        if let Some(existing) = slot.connected_snapshot() {
            info!(server = %definition.id, "Already connected; reusing existing connection");
            return Ok(existing);
        }
        // A cancelled attempt has no outcome worth sharing; start over.
        if let Some(error) = awaited
            .and_then(|generation| slot.failure_of(generation))
            .filter(|error| *error != McpError::Cancelled)
        {
            info!(server = %definition.id, "Concurrent connection attempt failed: {}", error);
            return Err(error);
        }

        let operation_timeout = definition
            .operation_timeout()
            .unwrap_or(self.settings.operation_timeout);
        let generation = Uuid::new_v4();
        let stale = slot.begin_connecting(definition, operation_timeout, generation);
        let mut attempt = ConnectAttempt::new(
            Arc::clone(&slot),
            &definition.id,
            generation,
            operation_timeout,
        );
        if let Some(stale) = stale {
            stale.run(operation_timeout).await;
        }

        info!(
            server = %definition.id,
            transport = %definition.transport,
            "Connecting to MCP server: {}",
            definition.name
        );

        let transport = match self.factory.build(definition) {
            Ok(transport) => transport,
            Err(e) => {
                error!(server = %definition.id, "Failed to build transport: {}", e);
                return Err(attempt.fail(e).await);
            }
        };

        let session = Arc::new(Session::new(definition.id.clone(), transport));
        attempt.attach(Arc::clone(&session));

        let handshake = async {
            session.open().await?;
            session.initialize().await?;
            let tools = session.list_tools().await?;
            info!(server = %definition.id, "Discovered {} tools", tools.len());
            Ok::<(), McpError>(())
        };
        if let Err(e) = Deadline::handshake(self.settings.connect_timeout)
            .run(&session, handshake)
            .await
        {
            error!(server = %definition.id, "Failed to connect: {}", e);
            return Err(attempt.fail(e).await);
        }

        let policy = self.settings.monitor.for_definition(definition);
        let monitor = spawn_monitor(
            Arc::clone(&slot),
            generation,
            Arc::clone(&session),
            policy,
            operation_timeout,
        );

        match slot.mark_connected(generation, Arc::clone(&session), self.clock.utc(), Some(monitor)) {
            Some(snapshot) => {
                attempt.finish();
                info!(server = %definition.id, "Connected to MCP server");
                Ok(snapshot)
            }
            None => Err(attempt.fail(McpError::SessionClosed).await),
        }
    }

    /// Connects every definition concurrently, logging failures and carrying on.
    pub async fn connect_all(
        &self,
        definitions: &[ServerDefinition],
    ) -> Vec<(String, Result<ConnectionSnapshot, McpError>)> {
        let attempts = definitions.iter().map(|definition| async move {
            let result = self.connect(definition).await;
            match &result {
                Ok(_) => info!("Connected to MCP server: {}", definition.id),
                Err(e) => error!("Failed to connect to MCP server {}: {}", definition.id, e),
            }
            (definition.id.clone(), result)
        });
        join_all(attempts).await
    }

    /// Removes the record for `id`, closing its session. Unknown ids are a
    /// no-op and close failures are only logged.
    pub async fn disconnect(&self, id: &str) {
        let Some(slot) = self.slot(id) else {
            debug!(server = %id, "Disconnect requested for unknown server");
            return;
        };
        let _lifecycle = slot.lock_lifecycle().await;
        if slot.is_retired() {
            return;
        }

        let teardown = slot.retire();
        {
            let mut slots = self.slots.write();
            if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(id);
            }
        }
        if let Some(teardown) = teardown {
            teardown.run(self.settings.operation_timeout).await;
        }
        info!(server = %id, "Disconnected MCP server");
    }

    /// Disconnects everything concurrently; meant for process shutdown.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.slots.read().keys().cloned().collect();
        info!("Disconnecting {} MCP servers", ids.len());
        join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }

    pub fn get_connection(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.slot(id)?.snapshot()
    }

    pub fn list_connections(&self) -> Vec<ConnectionSnapshot> {
        let slots: Vec<Arc<Slot>> = self.slots.read().values().cloned().collect();
        let mut snapshots: Vec<ConnectionSnapshot> =
            slots.iter().filter_map(|slot| slot.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Runs `call` against the connected session of `id` under the operation
    /// deadline. A terminal failure flips the record to `error`.
    async fn with_session<T, F, Fut>(&self, id: &str, call: F) -> Result<T, McpError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, McpError>>,
    {
        let active = self
            .slot(id)
            .and_then(|slot| slot.active_session().map(|active| (slot, active)));
        let Some((slot, active)) = active else {
            return Err(McpError::NotConnected(id.to_string()));
        };

        let result = Deadline::operation(active.operation_timeout)
            .run(&active.session, call(Arc::clone(&active.session)))
            .await;

        if let Err(e) = &result {
            if e.is_terminal() {
                warn!(server = %id, "Call failed, marking connection as error: {}", e);
                if let Some(teardown) = slot.fail(active.generation, e.clone()) {
                    teardown.run(active.operation_timeout).await;
                }
            }
        }
        result
    }

    pub async fn ping(&self, id: &str) -> Result<(), McpError> {
        self.with_session(id, |session| async move { session.ping().await })
            .await
    }

    pub async fn list_tools(&self, id: &str) -> Result<Vec<McpTool>, McpError> {
        self.with_session(id, |session| async move { session.list_tools().await })
            .await
    }

    pub async fn list_prompts(&self, id: &str) -> Result<Vec<McpPrompt>, McpError> {
        self.with_session(id, |session| async move { session.list_prompts().await })
            .await
    }

    pub async fn list_resources(&self, id: &str) -> Result<Vec<McpResource>, McpError> {
        self.with_session(id, |session| async move { session.list_resources().await })
            .await
    }

    pub async fn invoke_tool(
        &self,
        id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        self.with_session(id, |session| async move {
            session.invoke_tool(tool_name, arguments).await
        })
        .await
    }

    pub async fn fetch_prompt(
        &self,
        id: &str,
        prompt_name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        self.with_session(id, |session| async move {
            session.fetch_prompt(prompt_name, arguments).await
        })
        .await
    }

    pub async fn read_resource(&self, id: &str, uri: &str) -> Result<Value, McpError> {
        self.with_session(id, |session| async move { session.read_resource(uri).await })
            .await
    }

    fn identity(&self, id: &str) -> Option<ServerIdentity> {
        self.slot(id)?.active_session()?.session.identity()
    }

    /// Checks every registered server concurrently.
    pub async fn health_report(&self) -> HealthReport {
        let checks = join_all(
            self.list_connections()
                .into_iter()
                .map(|snapshot| self.check_health(snapshot)),
        )
        .await;
        HealthReport::new(checks)
    }

    async fn check_health(&self, snapshot: ConnectionSnapshot) -> HealthCheck {
        let mut check = HealthCheck {
            id: snapshot.id.clone(),
            status: snapshot.status,
            healthy: false,
            server_info: None,
            capabilities: None,
            last_connected: snapshot.last_connected,
            error: snapshot.last_error.clone(),
        };
        if snapshot.status != ConnectionStatus::Connected {
            return check;
        }

        let id = snapshot.id.as_str();
        let counts = async {
            self.ping(id).await?;
            Ok::<_, McpError>(CapabilityCounts {
                tools: self.list_tools(id).await?.len(),
                prompts: unsupported_as_empty(self.list_prompts(id).await)?.len(),
                resources: unsupported_as_empty(self.list_resources(id).await)?.len(),
            })
        }
        .await;

        match counts {
            Ok(counts) => {
                check.healthy = true;
                check.server_info = self.identity(id).map(|identity| identity.server_info);
                check.capabilities = Some(counts);
            }
            Err(e) => {
                check.status = self
                    .get_connection(id)
                    .map_or(ConnectionStatus::Disconnected, |s| s.status);
                check.error = Some(e.to_string());
            }
        }
        check
    }

    /// Exercises identity, tools, prompts and resources queries one after the
    /// other, collecting every failure instead of stopping at the first.
    pub async fn probe(&self, id: &str) -> Result<ProbeReport, McpError> {
        if self.slot(id).and_then(|slot| slot.active_session()).is_none() {
            return Err(McpError::NotConnected(id.to_string()));
        }
        let mut errors = Vec::new();

        let server_info = match self.ping(id).await {
            Ok(()) => self.identity(id),
            Err(e) => {
                errors.push(format!("Server info test failed: {}", e));
                None
            }
        };
        let tools = self
            .list_tools(id)
            .await
            .map_err(|e| errors.push(format!("Tools test failed: {}", e)))
            .ok();
        let prompts = unsupported_as_empty(self.list_prompts(id).await)
            .map_err(|e| errors.push(format!("Prompts test failed: {}", e)))
            .ok();
        let resources = unsupported_as_empty(self.list_resources(id).await)
            .map_err(|e| errors.push(format!("Resources test failed: {}", e)))
            .ok();

        for message in &errors {
            warn!(server = %id, "{}", message);
        }

        Ok(ProbeReport {
            server_id: id.to_string(),
            healthy: errors.is_empty(),
            server_info,
            tools,
            prompts,
            resources,
            errors,
        })
    }
}

/// Servers that do not offer a capability answer "method not found".
fn unsupported_as_empty<T>(result: Result<Vec<T>, McpError>) -> Result<Vec<T>, McpError> {
    match result {
        Err(McpError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => Ok(Vec::new()),
        other => other,
    }
}

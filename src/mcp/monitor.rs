use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mcp::connection::Slot;
use crate::mcp::deadline::Deadline;
use crate::mcp::session::Session;
use crate::mcp::types::ServerDefinition;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_LIFETIME: Duration = Duration::from_secs(300);

/// How often a connected server is pinged, and for how long at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPolicy {
    pub interval: Duration,
    /// Monitoring stops after this long even if every check passed.
    /// `None` keeps checking for as long as the record stays connected.
    pub lifetime: Option<Duration>,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
            lifetime: Some(DEFAULT_HEALTH_LIFETIME),
        }
    }
}

impl MonitorPolicy {
    /// Applies the definition's own interval/lifetime overrides, if any.
    pub fn for_definition(&self, definition: &ServerDefinition) -> Self {
        let mut policy = *self;
        if let Some(ms) = definition.config.health_check_interval_ms.filter(|ms| *ms > 0) {
            policy.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = definition.config.health_check_lifetime_ms {
            policy.lifetime = (ms > 0).then(|| Duration::from_millis(ms));
        }
        policy
    }
}

pub(crate) fn spawn_monitor(
    slot: Arc<Slot>,
    generation: Uuid,
    session: Arc<Session>,
    policy: MonitorPolicy,
    check_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(run_monitor(slot, generation, session, policy, check_timeout))
}

async fn run_monitor(
    slot: Arc<Slot>,
    generation: Uuid,
    session: Arc<Session>,
    policy: MonitorPolicy,
    check_timeout: Duration,
) {
    let server_id = session.server_id().to_string();
    let started = Instant::now();
    let mut ticker = interval_at(started + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if policy
            .lifetime
            .is_some_and(|lifetime| started.elapsed() >= lifetime)
        {
            info!(server = %server_id, "Health monitoring lifetime reached; stopping");
            return;
        }
        if !slot.is_current(generation) {
            debug!(server = %server_id, "Record no longer connected; stopping monitor");
            return;
        }

        match Deadline::operation(check_timeout)
            .run(&session, session.ping())
            .await
        {
            Ok(()) => debug!(server = %server_id, "Health check passed"),
            Err(e) => {
                warn!(server = %server_id, "Health check failed: {}", e);
                if let Some(teardown) = slot.fail(generation, e) {
                    teardown.detach_monitor().run(check_timeout).await;
                }
                return;
            }
        }
    }
}

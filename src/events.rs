//! Operational events emitted by the service

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::engine::OperationKind;
use crate::pool::ConnectionId;

/// Lifecycle and degradation events, for operational tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServiceEvent {
   Initialized,
   ConnectionCreated { id: ConnectionId },
   ConnectionClosed { id: ConnectionId },
   ConnectionUnhealthy { id: ConnectionId },
   FallbackEnabled { reason: String },
   FallbackUsed { sql: String, kind: OperationKind },
   HealthCheckFailed { id: ConnectionId, error: String },
   Shutdown,
}

/// Broadcast fan-out of [`ServiceEvent`]s.
///
/// Emitting never blocks; with no subscribers events are dropped, and slow
/// subscribers observe `Lagged` instead of holding up the service.
#[derive(Debug, Clone)]
pub struct EventBus {
   tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
   pub fn new(capacity: usize) -> Self {
      let (tx, _) = broadcast::channel(capacity.max(1));
      Self { tx }
   }

   pub fn emit(&self, event: ServiceEvent) {
      trace!(?event, "Emitting service event");
      let _ = self.tx.send(event);
   }

   pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
      self.tx.subscribe()
   }
}

//! Domain events, emitted after the transaction that caused them commits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::types::{BetId, BetOutcome, GroupId, UserId};

/// Lifecycle notifications for the delivery layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BetEvent {
    BetCreated {
        bet_id: BetId,
        group_id: GroupId,
        creator_id: UserId,
        title: String,
    },
    BetClosed {
        bet_id: BetId,
        group_id: GroupId,
        /// None when closed by the deadline sweep
        closed_by: Option<UserId>,
    },
    BetResolved {
        bet_id: BetId,
        group_id: GroupId,
        outcome: BetOutcome,
        winners: Vec<UserId>,
    },
    BetCancelled {
        bet_id: BetId,
        group_id: GroupId,
        reason: Option<String>,
    },
    ResolutionDeadlineApproaching {
        bet_id: BetId,
        group_id: GroupId,
        resolve_date: DateTime<Utc>,
        pending_voters: Vec<UserId>,
    },
    LoserClaimed {
        bet_id: BetId,
        group_id: GroupId,
        loser_id: UserId,
        winners: Vec<UserId>,
    },
    FulfillmentCompleted {
        bet_id: BetId,
        group_id: GroupId,
    },
}

impl BetEvent {
    pub fn bet_id(&self) -> BetId {
        match self {
            BetEvent::BetCreated { bet_id, .. }
            | BetEvent::BetClosed { bet_id, .. }
            | BetEvent::BetResolved { bet_id, .. }
            | BetEvent::BetCancelled { bet_id, .. }
            | BetEvent::ResolutionDeadlineApproaching { bet_id, .. }
            | BetEvent::LoserClaimed { bet_id, .. }
            | BetEvent::FulfillmentCompleted { bet_id, .. } => *bet_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BetEvent::BetCreated { .. } => "bet_created",
            BetEvent::BetClosed { .. } => "bet_closed",
            BetEvent::BetResolved { .. } => "bet_resolved",
            BetEvent::BetCancelled { .. } => "bet_cancelled",
            BetEvent::ResolutionDeadlineApproaching { .. } => "resolution_deadline_approaching",
            BetEvent::LoserClaimed { .. } => "loser_claimed",
            BetEvent::FulfillmentCompleted { .. } => "fulfillment_completed",
        }
    }
}

/// Outbound event seam. Delivery failures are the sink's problem; the
/// lifecycle has already committed.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: BetEvent);
}

/// Fan-out over a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<BetEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Sink buffering `event_channel_capacity` events per subscriber
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.event_channel_capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BetEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: BetEvent) {
        let name = event.name();
        let bet_id = event.bet_id();
        // no subscribers is not an error
        if self.sender.send(event).is_err() {
            debug!(event = name, bet_id = %bet_id, "event dropped, no subscribers");
        }
    }
}

/// Logs every event; the default when no delivery layer is wired
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: BetEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(event = event.name(), bet_id = %event.bet_id(), payload = %payload, "bet event");
    }
}

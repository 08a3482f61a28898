//! Event envelope - the common wrapper for all notifications.

use chrono::{DateTime, Utc};
use drx_id::{EventId, ExecutionId};
use serde::{Deserialize, Serialize};

use crate::{EventError, EventPayload};

/// Who caused the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// An operator issuing a control request.
    User,
    /// The tick driver.
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Common metadata for every notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Monotonic per-process sequence number.
    pub event_id: EventId,

    pub occurred_at: DateTime<Utc>,

    /// One of the `event_types` constants.
    pub event_type: String,

    pub execution_id: ExecutionId,

    pub actor_type: ActorType,
    pub actor_id: String,

    pub payload: P,
}

/// The envelope every notifier receives.
pub type ExecutionEvent = EventEnvelope<EventPayload>;

impl ExecutionEvent {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// The payload rendered as compact JSON, for sinks that log or forward
    /// events as text.
    pub fn payload_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Builder for [`ExecutionEvent`].
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    execution_id: Option<ExecutionId>,
    actor_type: ActorType,
    actor_id: Option<String>,
    payload: Option<EventPayload>,
}

impl EventEnvelopeBuilder {
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the envelope; the event type is derived from the payload.
    pub fn build(self) -> Result<ExecutionEvent, EventError> {
        let payload = self.payload.ok_or(EventError::MissingField("payload"))?;
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            event_type: payload.event_type().to_string(),
            execution_id: self
                .execution_id
                .ok_or(EventError::MissingField("execution_id"))?,
            actor_type: self.actor_type,
            actor_id: self.actor_id.unwrap_or_else(|| "scheduler".to_string()),
            payload,
        })
    }
}

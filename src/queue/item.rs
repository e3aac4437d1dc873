use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::domain::{
    entities::{ParentRef, QueueItemRecord},
    types::ItemState,
};

use super::{QueueError, QueuePayload};

/// A queue row with its payload decoded into the queue's payload type.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem<P> {
    pub id: i64,
    pub queue_name: String,
    pub payload: P,
    pub parent: Option<ParentRef>,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
    pub reserved_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

impl<P: QueuePayload> QueueItem<P> {
    pub(crate) fn decode(record: QueueItemRecord) -> Result<Self, QueueError> {
        let payload = serde_json::from_value(record.payload).map_err(|source| {
            QueueError::Payload {
                queue: record.queue_name.clone(),
                id: record.id,
                source,
            }
        })?;

        Ok(Self {
            id: record.id,
            queue_name: record.queue_name,
            payload,
            parent: record.parent,
            attempts: record.attempts,
            created_at: record.created_at,
            reserved_at: record.reserved_at,
            completed_at: record.completed_at,
            failed_at: record.failed_at,
        })
    }
}

impl<P> QueueItem<P> {
    pub fn state(&self) -> ItemState {
        ItemState::from_markers(
            self.reserved_at.is_some(),
            self.completed_at.is_some(),
            self.failed_at.is_some(),
        )
    }

    pub fn is_available(&self) -> bool {
        self.state() == ItemState::Available
    }

    /// Reference other items can carry to point back at this one.
    pub fn as_parent(&self) -> ParentRef {
        ParentRef {
            queue_name: self.queue_name.clone(),
            id: self.id,
        }
    }
}

/// Operator-facing view of an item with RFC 3339 timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub id: i64,
    pub queue: String,
    pub state: ItemState,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub attempts: i32,
    pub created_at: String,
    pub reserved_at: Option<String>,
    pub completed_at: Option<String>,
    pub failed_at: Option<String>,
}

impl<P: Serialize> QueueItem<P> {
    pub fn summary(&self) -> ItemSummary {
        ItemSummary {
            id: self.id,
            queue: self.queue_name.clone(),
            state: self.state(),
            payload: serde_json::to_value(&self.payload).unwrap_or(serde_json::Value::Null),
            parent: self.parent.clone(),
            attempts: self.attempts,
            created_at: rfc3339(self.created_at),
            reserved_at: self.reserved_at.map(rfc3339),
            completed_at: self.completed_at.map(rfc3339),
            failed_at: self.failed_at.map(rfc3339),
        }
    }
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

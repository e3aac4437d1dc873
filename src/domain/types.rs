//! Shared domain enumerations aligned with persisted columns.

use serde::{Deserialize, Serialize};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Publish,
    Future,
    Draft,
    Pending,
    Private,
    Trash,
}

impl PostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Publish => "publish",
            PostStatus::Future => "future",
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
            PostStatus::Private => "private",
            PostStatus::Trash => "trash",
        }
    }

    /// Whether the post is visible on public archives.
    pub fn is_public(self) -> bool {
        matches!(self, PostStatus::Publish)
    }
}

impl TryFrom<&str> for PostStatus {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "publish" => Ok(PostStatus::Publish),
            "future" => Ok(PostStatus::Future),
            "draft" => Ok(PostStatus::Draft),
            "pending" => Ok(PostStatus::Pending),
            "private" => Ok(PostStatus::Private),
            "trash" => Ok(PostStatus::Trash),
            other => Err(DomainError::unknown("post status", other)),
        }
    }
}

/// Lifecycle state of a queue item, derived from its timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Available,
    Reserved,
    Completed,
    Failed,
}

impl ItemState {
    /// Terminal markers win over reservation: failed, then completed.
    pub fn from_markers(reserved: bool, completed: bool, failed: bool) -> Self {
        if failed {
            ItemState::Failed
        } else if completed {
            ItemState::Completed
        } else if reserved {
            ItemState::Reserved
        } else {
            ItemState::Available
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Available => "available",
            ItemState::Reserved => "reserved",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for ItemState {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "available" => Ok(ItemState::Available),
            "reserved" => Ok(ItemState::Reserved),
            "completed" => Ok(ItemState::Completed),
            "failed" => Ok(ItemState::Failed),
            other => Err(DomainError::unknown("item state", other)),
        }
    }
}

//! Domain entities mirrored from persistent storage.

use serde::Serialize;
use time::{Date, Month, OffsetDateTime, Time};

use crate::domain::{error::DomainError, types::ItemState, types::PostStatus};

/// Weak link from an item to the item that produced it.
///
/// Lookups through a `ParentRef` may find nothing: the parent can be deleted
/// independently and nothing cascades.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ParentRef {
    pub queue_name: String,
    pub id: i64,
}

/// A queue row with its payload still in stored (JSON) form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItemRecord {
    pub id: i64,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub dedup_key: String,
    pub parent: Option<ParentRef>,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
    pub reserved_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

impl QueueItemRecord {
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
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermRecord {
    pub id: i64,
    pub taxonomy: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostRecord {
    pub id: i64,
    pub slug: String,
    pub post_type: String,
    pub status: PostStatus,
    pub author_slug: Option<String>,
    pub published_at: Option<OffsetDateTime>,
    pub terms: Vec<TermRecord>,
}

/// A year, month or day archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateArchive {
    pub year: i32,
    pub month: Option<Month>,
    pub day: Option<u8>,
}

impl DateArchive {
    pub fn year(year: i32) -> Self {
        Self {
            year,
            month: None,
            day: None,
        }
    }

    pub fn month(year: i32, month: Month) -> Self {
        Self {
            year,
            month: Some(month),
            day: None,
        }
    }

    pub fn day(date: Date) -> Self {
        Self {
            year: date.year(),
            month: Some(date.month()),
            day: Some(date.day()),
        }
    }

    /// Half-open UTC interval `[start, end)` covered by the archive.
    pub fn bounds(&self) -> Result<(OffsetDateTime, OffsetDateTime), DomainError> {
        let invalid = |err: time::error::ComponentRange| DomainError::invalid_archive(err.to_string());

        let (start, end) = match (self.month, self.day) {
            (None, _) => {
                let start = Date::from_calendar_date(self.year, Month::January, 1).map_err(invalid)?;
                let end =
                    Date::from_calendar_date(self.year + 1, Month::January, 1).map_err(invalid)?;
                (start, end)
            }
            (Some(month), None) => {
                let start = Date::from_calendar_date(self.year, month, 1).map_err(invalid)?;
                let (next_year, next_month) = if month == Month::December {
                    (self.year + 1, Month::January)
                } else {
                    (self.year, month.next())
                };
                let end = Date::from_calendar_date(next_year, next_month, 1).map_err(invalid)?;
                (start, end)
            }
            (Some(month), Some(day)) => {
                let start = Date::from_calendar_date(self.year, month, day).map_err(invalid)?;
                let end = start
                    .next_day()
                    .ok_or_else(|| DomainError::invalid_archive("day archive overflows calendar"))?;
                (start, end)
            }
        };

        Ok((
            start.with_time(Time::MIDNIGHT).assume_utc(),
            end.with_time(Time::MIDNIGHT).assume_utc(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;

    fn record() -> QueueItemRecord {
        QueueItemRecord {
            id: 1,
            queue_name: "q".to_string(),
            payload: serde_json::Value::Null,
            dedup_key: "k".to_string(),
            parent: None,
            attempts: 0,
            created_at: datetime!(2025-01-01 0:00 UTC),
            reserved_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    #[test]
    fn state_follows_timestamp_precedence() {
        let mut item = record();
        assert_eq!(item.state(), ItemState::Available);

        item.reserved_at = Some(datetime!(2025-01-01 0:01 UTC));
        assert_eq!(item.state(), ItemState::Reserved);

        item.completed_at = Some(datetime!(2025-01-01 0:02 UTC));
        assert_eq!(item.state(), ItemState::Completed);

        item.failed_at = Some(datetime!(2025-01-01 0:03 UTC));
        assert_eq!(item.state(), ItemState::Failed);
        assert!(!item.is_available());
    }

    #[test]
    fn month_bounds_roll_over_december() {
        let (start, end) = DateArchive::month(2024, Month::December).bounds().unwrap();
        assert_eq!(start, datetime!(2024-12-01 0:00 UTC));
        assert_eq!(end, datetime!(2025-01-01 0:00 UTC));
    }

    #[test]
    fn day_and_year_bounds() {
        let (start, end) = DateArchive::day(date!(2024-02-29)).bounds().unwrap();
        assert_eq!(start, datetime!(2024-02-29 0:00 UTC));
        assert_eq!(end, datetime!(2024-03-01 0:00 UTC));

        let (start, end) = DateArchive::year(2023).bounds().unwrap();
        assert_eq!(start, datetime!(2023-01-01 0:00 UTC));
        assert_eq!(end, datetime!(2024-01-01 0:00 UTC));
    }

    #[test]
    fn invalid_day_is_rejected() {
        let archive = DateArchive {
            year: 2023,
            month: Some(Month::February),
            day: Some(30),
        };
        assert!(archive.bounds().is_err());
    }
}

use time::OffsetDateTime;

use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
            RepoError::Duplicate {
                constraint: db
                    .message()
                    .trim_start_matches("UNIQUE constraint failed: ")
                    .to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("FOREIGN KEY constraint failed")
                || db.message().contains("datatype mismatch") =>
        {
            RepoError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("constraint failed") => {
            RepoError::Integrity {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("database is locked")
                || db.message().contains("interrupted") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

/// Stored representation of a timestamp: microseconds since the Unix epoch.
pub fn to_micros(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(value: i64) -> Result<OffsetDateTime, RepoError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000).map_err(|err| {
        RepoError::Integrity {
            message: format!("stored timestamp {value} is out of range: {err}"),
        }
    })
}

pub fn from_micros_opt(value: Option<i64>) -> Result<Option<OffsetDateTime>, RepoError> {
    value.map(from_micros).transpose()
}

pub fn convert_count(value: i64) -> Result<u64, RepoError> {
    value
        .try_into()
        .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn micros_round_trip_drops_sub_microsecond_precision() {
        let ts = datetime!(2025-03-04 05:06:07.123_456_789 UTC);
        let stored = to_micros(ts);
        assert_eq!(stored % 1_000_000, 123_456);
        assert_eq!(
            from_micros(stored).unwrap(),
            datetime!(2025-03-04 05:06:07.123_456 UTC)
        );
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert!(convert_count(-1).is_err());
        assert_eq!(convert_count(7).unwrap(), 7);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            RepoError::NotFound
        ));
    }
}

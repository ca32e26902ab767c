//! Page store failures.

use thiserror::Error;

/// What kind of database failure a [`StoreError::Database`] carries.
///
/// Supervision looks at this to tell a busy database from a broken one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreDbErrorKind {
    #[error("busy")]
    BusyOrLocked,
    #[error("constraint")]
    ConstraintViolation,
    #[error("pool timeout")]
    PoolTimeout,
    #[error("no row")]
    RowNotFound,
    #[error("other")]
    Other,
}

impl StoreDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Database(db) => Self::from_database(db.as_ref()),
            _ => Self::Other,
        }
    }

    fn from_database(db: &dyn sqlx::error::DatabaseError) -> Self {
        // SQLITE_BUSY = 5, SQLITE_LOCKED = 6; extended codes keep the low byte.
        let primary = db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
        match primary {
            Some(5 | 6) => Self::BusyOrLocked,
            Some(19) => Self::ConstraintViolation,
            _ if db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation() =>
            {
                Self::ConstraintViolation
            }
            _ if db.message().contains("database is locked") => Self::BusyOrLocked,
            _ => Self::Other,
        }
    }

    /// A retry shortly after may succeed.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::BusyOrLocked | Self::PoolTimeout)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error ({kind}): {message}")]
    Database {
        kind: StoreDbErrorKind,
        message: String,
    },

    #[error("no page with id {0}")]
    PageNotFound(i64),

    /// A state column held a value this build does not know.
    #[error("page {id} has unknown {column} '{value}'")]
    CorruptRow {
        id: i64,
        column: &'static str,
        value: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreDbErrorKind> {
        if let Self::Database { kind, .. } = self {
            Some(*kind)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(StoreDbErrorKind::BusyOrLocked)
    }
}

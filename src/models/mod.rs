mod delivery;
mod event;
mod quota;
mod suppression;

pub use delivery::*;
pub use event::*;
pub use quota::*;
pub use suppression::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("no row matches that filter")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("{0}")]
    Internal(String),
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql
            && db_err.is_unique_violation()
        {
            return Error::Conflict;
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound;
        }
        Error::Database(sql)
    }
}

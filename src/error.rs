use thiserror::Error;

use crate::scm::ScmError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("XML parse error at position {position}: {source}")]
    Xml {
        source: quick_xml::Error,
        position: usize,
    },

    /// No usable coverage document could be extracted from an upload.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("SCM error: {0}")]
    Scm(#[from] ScmError),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// True when the store refused a lock because another connection holds it.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            RelayError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

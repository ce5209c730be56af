//! Error types for db_mirror

use thiserror::Error;

use crate::stats::RunStatistics;

/// Result type for db_mirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// MySQL server error numbers that indicate a transient condition
const MYSQL_TRANSIENT_ERRORS: &[u16] = &[
    1040, // too many connections
    1205, // lock wait timeout
    1213, // deadlock
    2006, // server has gone away
    2013, // lost connection during query
];

/// Error types for db_mirror
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connectivity error during {context}: {message}")]
    Connectivity { context: String, message: String },

    #[error("Constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },

    #[error("DDL failed for {table}: {message}")]
    DdlApplication { table: String, message: String },

    #[error("Schema analysis error: {0}")]
    SchemaAnalysis(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Synchronization cancelled after {} tables", .0.tables_processed)]
    Cancelled(Box<RunStatistics>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Value decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify a driver error raised while doing `context`
    pub fn from_sqlx(context: impl Into<String>, error: sqlx::Error) -> Self {
        let context = context.into();
        match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_) => Error::Connectivity {
                context,
                message: error.to_string(),
            },
            sqlx::Error::Database(db_error) => {
                if db_error.is_foreign_key_violation() || db_error.is_unique_violation() {
                    return Error::ConstraintViolation {
                        table: context,
                        message: db_error.message().to_string(),
                    };
                }

                let number = db_error
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number());
                match number {
                    Some(n) if MYSQL_TRANSIENT_ERRORS.contains(&n) => Error::Connectivity {
                        context,
                        message: db_error.message().to_string(),
                    },
                    _ => Error::Database(format!("{}: {}", context, db_error.message())),
                }
            }
            _ => Error::Database(format!("{}: {}", context, error)),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connectivity { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::ConstraintViolation { .. })
    }

    /// Errors that abort the whole run instead of a single table
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalConfiguration(_) | Error::Cancelled(_))
    }
}

/// Convert Serde JSON errors to db_mirror errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

/// Convert TOML deserialization errors to db_mirror errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

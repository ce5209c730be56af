//! Database module for db_mirror
//!
//! This module holds the handle interface the engine talks to, its MySQL
//! implementation, and the value types rows are decoded into.

pub mod connection;
pub mod handle;
pub mod retry;
pub mod session;
pub mod sql;
pub mod value;

// Re-export key types
pub use connection::DatabaseConnection;
pub use handle::{DatabaseHandle, Statement};
pub use retry::RetryPolicy;
pub use session::{SessionCommand, SessionState};
pub use value::{Row, RowKey, Value};

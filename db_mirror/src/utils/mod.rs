//! Utilities for db_mirror

pub mod logging;

pub use logging::init_logging;

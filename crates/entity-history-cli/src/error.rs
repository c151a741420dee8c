//! Error types for the command-line tool.
//!
//! [`CliError`] wraps every failure mode of a single invocation so `main`
//! can propagate with `?`.

use entity_history_db::DbError;

use crate::config::ConfigError;

/// Top-level error for the `entity-history` binary.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// A database operation failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: DbError,
    },

    /// Writing results to stdout failed.
    #[error("output error: {source}")]
    Output {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Encoding a result as JSON failed.
    #[error("encoding error: {source}")]
    Encode {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },
}

use thiserror::Error;

/// Failure classes surfaced by the library.
///
/// Driver-internal errors never panic; they are converted into error
/// [`QueryResult`](crate::QueryResult)s on the callback path and into these
/// variants on the awaitable path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Operation on a database handle with no backing driver.
    #[error("database handle has no driver")]
    InvalidDriver,

    /// Handshake failed or the connection was lost.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The backend rejected a submission before executing it.
    #[error("query submission failed: {0}")]
    Submit(String),

    /// The command executed but the server reported an error.
    #[error("query failed: {0}")]
    Query(String),

    /// Pipeline mode was requested while the connection was busy.
    #[error("pipeline mode refused")]
    PipelineRefused,

    /// The recorded schema version is newer than the compiled-in steps.
    #[error("database version {active} is ahead of the latest known migration {latest}")]
    MigrationAhead { active: i64, latest: i64 },

    /// Anything else that went wrong while parsing or applying migrations.
    #[error("migration failed: {0}")]
    Migration(String),

    #[error("connection pool `{0}` does not exist")]
    PoolNotFound(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

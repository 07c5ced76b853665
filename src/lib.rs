//! asql: asynchronous SQL client library.
//!
//! Non-blocking query execution over callback- and future-based APIs, a
//! per-thread connection pool, request-scoped cancellation through
//! [`Receiver`] objects, scoped transactions, a coalescing result cache and
//! a schema migration engine. Postgres is the primary backend; SQLite is
//! the embedded one.
//!
//! Everything is thread-confined by design: run the library on a tokio
//! current-thread runtime inside a [`tokio::task::LocalSet`].
//!
//! ```no_run
//! use asql::{Pool, params};
//! use asql::postgres::Postgres;
//!
//! # async fn demo() -> Result<(), asql::Error> {
//! Pool::create("main", Postgres::factory("postgres://localhost/app"));
//! let db = Pool::database("main");
//! let result = db
//!     .execute("SELECT $1::int8 + 1", params![41i64])
//!     .await?;
//! assert_eq!(result.first().unwrap().get(0).to_i64(), Some(42));
//! # Ok(())
//! # }
//! ```

pub use asql_core::*;
pub use asql_core::params;

#[cfg(feature = "postgres")]
pub mod postgres {
    pub use asql_postgres::{PgDriver, Postgres};
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    pub use asql_sqlite::{Sqlite, SqliteDriver};
}

//! SQLite backend for asql.
//!
//! The embedded library is synchronous, so each driver owns a worker thread
//! holding the connection; commands and results travel over a queued-message
//! channel and callbacks fire on the owning thread. Use the driver on a
//! tokio current-thread runtime inside a [`tokio::task::LocalSet`].

mod driver;
mod extract;
mod sqlite;
mod worker;

pub use driver::SqliteDriver;
pub use sqlite::Sqlite;

//! Postgres backend for asql.
//!
//! The driver is thread-confined: create and use it on a tokio
//! current-thread runtime inside a [`tokio::task::LocalSet`].

mod driver;
mod params;
mod postgres;

pub use driver::PgDriver;
pub use postgres::Postgres;

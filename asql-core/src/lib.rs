mod awaitable;
mod cache;
mod database;
mod driver;
mod error;
mod migrations;
pub mod mock;
mod pool;
mod prepared;
mod receiver;
mod result;
mod transaction;
mod value;

pub use awaitable::*;
pub use cache::*;
pub use database::*;
pub use driver::*;
pub use error::*;
pub use migrations::*;
pub use pool::*;
pub use prepared::*;
pub use receiver::*;
pub use result::*;
pub use transaction::*;
pub use value::*;

pub mod stream {
    pub use ::futures::stream::*;
}

use crate::SqliteDriver;
use asql_core::{Database, Driver, DriverFactory};
use std::rc::Rc;

/// Entry points for the SQLite backend.
///
/// ```
/// use asql_sqlite::Sqlite;
///
/// let db = Sqlite::database("sqlite://?MEMORY");
/// ```
pub struct Sqlite {
    info: String,
}

impl Sqlite {
    /// Driver factory for [`asql_core::Pool`] registration.
    pub fn factory(info: impl Into<String>) -> Rc<dyn DriverFactory> {
        Rc::new(Self { info: info.into() })
    }

    /// Standalone database outside any pool.
    pub fn database(info: impl Into<String>) -> Database {
        Database::new(SqliteDriver::create(info))
    }
}

impl DriverFactory for Sqlite {
    fn create_driver(&self) -> Rc<dyn Driver> {
        SqliteDriver::create(self.info.clone())
    }
}

use crate::PgDriver;
use asql_core::{Database, Driver, DriverFactory};
use std::rc::Rc;

/// Entry points for the Postgres backend.
///
/// ```no_run
/// use asql_core::Pool;
/// use asql_postgres::Postgres;
///
/// Pool::create("main", Postgres::factory("postgres://localhost/app"));
/// let db = Pool::database("main");
/// ```
pub struct Postgres {
    info: String,
}

impl Postgres {
    /// Driver factory for [`asql_core::Pool`] registration.
    pub fn factory(info: impl Into<String>) -> Rc<dyn DriverFactory> {
        Rc::new(Self { info: info.into() })
    }

    /// Standalone database outside any pool.
    pub fn database(info: impl Into<String>) -> Database {
        Database::new(PgDriver::create(info))
    }
}

impl DriverFactory for Postgres {
    fn create_driver(&self) -> Rc<dyn Driver> {
        PgDriver::create(self.info.clone())
    }
}

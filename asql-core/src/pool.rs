use crate::awaitable::SingleShot;
use crate::{Database, Driver, DriverFactory, Error, Receiver, ReceiverWatch, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Name used by the single-pool convenience of most applications.
pub const DEFAULT_POOL: &str = "asql_default_pool";

struct QueuedClient {
    cb: Box<dyn FnOnce(Database)>,
    watch: ReceiverWatch,
}

struct PoolInner {
    name: String,
    factory: Rc<dyn DriverFactory>,
    idle: Vec<Rc<dyn Driver>>,
    queue: VecDeque<QueuedClient>,
    setup_cb: Option<Rc<dyn Fn(&Database)>>,
    reuse_cb: Option<Rc<dyn Fn(&Database)>>,
    max_idle: usize,
    max_connections: usize,
    connections: usize,
}

thread_local! {
    static POOLS: RefCell<HashMap<String, Rc<RefCell<PoolInner>>>> =
        RefCell::new(HashMap::new());
}

fn find_pool(name: &str) -> Option<Rc<RefCell<PoolInner>>> {
    POOLS.with_borrow(|pools| pools.get(name).cloned())
}

/// Per-thread registry of named connection pools.
///
/// A pool bounds the number of physical connections for one connection
/// string, keeps released drivers idle for reuse (most recently used first)
/// and queues overflowing lease requests. Pools are confined to the thread
/// that created them; a backend connection is not thread-safe so there is
/// nothing to share.
pub struct Pool;

impl Pool {
    /// Registers a pool. A duplicate name is ignored with a warning.
    pub fn create(name: impl Into<String>, factory: Rc<dyn DriverFactory>) {
        let name = name.into();
        POOLS.with_borrow_mut(|pools| {
            if pools.contains_key(&name) {
                log::warn!("ignoring pool creation, name already registered: {name}");
                return;
            }
            let inner = PoolInner {
                name: name.clone(),
                factory,
                idle: Vec::new(),
                queue: VecDeque::new(),
                setup_cb: None,
                reuse_cb: None,
                max_idle: 1,
                max_connections: 0,
                connections: 0,
            };
            pools.insert(name, Rc::new(RefCell::new(inner)));
        });
    }

    /// De-registers a pool. Databases already leased remain functional and
    /// their drivers are destroyed on release.
    pub fn remove(name: &str) {
        POOLS.with_borrow_mut(|pools| {
            pools.remove(name);
        });
    }

    /// Synchronous lease. Returns an invalid [`Database`] when the pool does
    /// not exist or the connection cap is reached; this form never waits.
    pub fn database(name: &str) -> Database {
        let Some(pool) = find_pool(name) else {
            log::error!("database pool not found: {name}");
            return Database::default();
        };
        let db = {
            let mut inner = pool.borrow_mut();
            if let Some(driver) = inner.idle.pop() {
                log::debug!("reusing a database connection from pool {name}");
                let reuse = inner.reuse_cb.clone();
                drop(inner);
                let db = lease(&pool, driver);
                if let Some(reuse) = reuse {
                    reuse(&db);
                }
                db
            } else if inner.max_connections > 0 && inner.connections >= inner.max_connections {
                log::warn!(
                    "maximum number of connections reached on pool {name}: {}",
                    inner.connections
                );
                return Database::default();
            } else {
                inner.connections += 1;
                log::debug!("creating a database connection for pool {name}");
                let driver = inner.factory.create_driver();
                let setup = inner.setup_cb.clone();
                drop(inner);
                let db = lease(&pool, driver);
                if let Some(setup) = setup {
                    setup(&db);
                }
                db
            }
        };
        db.open_quiet();
        db
    }

    /// Queued lease: when the connection cap is reached the callback waits
    /// until another lease is released. A dropped `receiver` removes the
    /// waiting entry without invoking the callback.
    pub fn database_with<F>(name: &str, receiver: Option<&Receiver>, cb: F)
    where
        F: FnOnce(Database) + 'static,
    {
        let Some(pool) = find_pool(name) else {
            log::error!("database pool not found: {name}");
            cb(Database::default());
            return;
        };
        {
            let mut inner = pool.borrow_mut();
            if inner.idle.is_empty()
                && inner.max_connections > 0
                && inner.connections >= inner.max_connections
            {
                log::debug!("connection cap reached on pool {name}, queuing lease");
                inner.queue.push_back(QueuedClient {
                    cb: Box::new(cb),
                    watch: receiver.into(),
                });
                return;
            }
        }
        let db = Self::database(name);
        cb(db);
    }

    /// Awaitable lease. Resolves immediately while under the cap, otherwise
    /// in release order. Dropping the future abandons the wait.
    pub fn acquire(name: &str) -> SingleShot<Result<Database>> {
        let (future, completer) = SingleShot::new(Some(Receiver::new()));
        if find_pool(name).is_none() {
            completer.complete(Err(Error::PoolNotFound(name.to_string())));
            return future;
        }
        Self::database_with(name, future.receiver(), move |db| {
            completer.complete(Ok(db));
        });
        future
    }

    /// Number of currently live connections (leased plus idle).
    pub fn current_connections(name: &str) -> usize {
        find_pool(name).map_or(0, |pool| pool.borrow().connections)
    }

    /// Connections kept idle beyond this count are destroyed on release.
    pub fn set_max_idle_connections(name: &str, max: usize) {
        with_pool(name, |inner| inner.max_idle = max);
    }

    /// Hard cap on live connections; `0` means unlimited.
    pub fn set_max_connections(name: &str, max: usize) {
        with_pool(name, |inner| inner.max_connections = max);
    }

    /// Runs once for every newly created connection.
    pub fn set_setup_callback<F>(name: &str, cb: F)
    where
        F: Fn(&Database) + 'static,
    {
        with_pool(name, |inner| inner.setup_cb = Some(Rc::new(cb)));
    }

    /// Runs every time an idle connection is handed out again.
    pub fn set_reuse_callback<F>(name: &str, cb: F)
    where
        F: Fn(&Database) + 'static,
    {
        with_pool(name, |inner| inner.reuse_cb = Some(Rc::new(cb)));
    }
}

fn with_pool(name: &str, f: impl FnOnce(&mut PoolInner)) {
    match find_pool(name) {
        Some(pool) => f(&mut pool.borrow_mut()),
        None => log::error!("database pool not found: {name}"),
    }
}

fn lease(pool: &Rc<RefCell<PoolInner>>, driver: Rc<dyn Driver>) -> Database {
    let name = pool.borrow().name.clone();
    Database::pooled(
        driver.clone(),
        Rc::new(PoolLease {
            pool: name,
            driver: RefCell::new(Some(driver)),
        }),
    )
}

/// Guard held by every pooled [`Database`]; the last copy dropping returns
/// the driver to its pool.
pub struct PoolLease {
    pool: String,
    driver: RefCell<Option<Rc<dyn Driver>>>,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.borrow_mut().take() {
            push_database_back(&self.pool, driver);
        }
    }
}

/// Release policy: a disconnected driver is destroyed, a live waiter is
/// served first, the idle cap is enforced, and only then is the driver
/// parked (LIFO, so the most recently used connection stays hot).
fn push_database_back(name: &str, driver: Rc<dyn Driver>) {
    let Some(pool) = find_pool(name) else {
        driver.close();
        return;
    };
    let handoff = {
        let mut inner = pool.borrow_mut();
        if driver.state() == crate::ConnectionState::Disconnected {
            log::debug!("destroying released connection of pool {name}: not open");
            inner.connections -= 1;
            drop(inner);
            driver.close();
            return;
        }
        let mut handoff = None;
        while let Some(client) = inner.queue.pop_front() {
            if client.watch.is_cancelled() {
                continue;
            }
            handoff = Some(client.cb);
            break;
        }
        match handoff {
            Some(cb) => Some(cb),
            None => {
                if inner.idle.len() >= inner.max_idle {
                    log::debug!(
                        "destroying released connection of pool {name}: idle cap {} reached",
                        inner.max_idle
                    );
                    inner.connections -= 1;
                    drop(inner);
                    driver.close();
                } else {
                    log::debug!("returning connection to pool {name}");
                    inner.idle.push(driver);
                }
                return;
            }
        }
    };
    if let Some(cb) = handoff {
        let db = lease(&pool, driver);
        cb(db);
    }
}

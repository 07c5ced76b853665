use crate::awaitable::{SingleShot, result_to_output};
use crate::{Database, QueryResult, Receiver, ReceiverWatch, Result, ResultFn, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Result cache with single-flight coalescing.
///
/// Keyed on (query text, parameter values). While one query for a key is in
/// flight, concurrent callers for the same key join its waiter list and the
/// underlying database sees exactly one submission. Completed entries are
/// served from memory until [`Cache::clear`]ed or expired.
///
/// Errors are cached like successes, so every caller for the key sees the
/// same error until `clear`, unless [`Cache::set_cache_errors`] turned that
/// off.
#[derive(Clone)]
pub struct Cache {
    inner: Rc<CacheInner>,
}

struct CacheInner {
    db: RefCell<Database>,
    entries: RefCell<HashMap<CacheKey, CacheEntry>>,
    cache_errors: Cell<bool>,
}

#[derive(Clone)]
struct CacheKey {
    query: String,
    params: Vec<Value>,
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.query == other.query
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.query.hash(state);
        for param in &self.params {
            param.key_hash(state);
        }
    }
}

struct CacheWaiter {
    cb: ResultFn,
    watch: ReceiverWatch,
}

enum CacheEntry {
    Pending(Vec<CacheWaiter>),
    Done {
        result: Rc<QueryResult>,
        created: Instant,
    },
}

impl Cache {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                db: RefCell::new(db),
                entries: RefCell::new(HashMap::new()),
                cache_errors: Cell::new(true),
            }),
        }
    }

    pub fn set_database(&self, db: Database) {
        *self.inner.db.borrow_mut() = db;
    }

    /// When turned off, an error result is still fanned out to the waiters
    /// of the in-flight request but is not retained, so the next `exec`
    /// retries the query.
    pub fn set_cache_errors(&self, cache_errors: bool) {
        self.inner.cache_errors.set(cache_errors);
    }

    pub fn exec<F>(&self, query: impl Into<String>, cb: F)
    where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw(query.into(), Vec::new(), ReceiverWatch::none(), Box::new(cb));
    }

    pub fn exec_with<F>(
        &self,
        query: impl Into<String>,
        params: Vec<Value>,
        receiver: Option<&Receiver>,
        cb: F,
    ) where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw(query.into(), params, receiver.into(), Box::new(cb));
    }

    /// Awaitable form; resolves with the shared cached result.
    pub fn execute(&self, query: impl Into<String>, params: Vec<Value>) -> SingleShot<Result<Rc<QueryResult>>> {
        let (future, completer) = SingleShot::new(Some(Receiver::new()));
        let watch = future
            .receiver()
            .map(Receiver::watch)
            .unwrap_or_default();
        self.exec_raw(
            query.into(),
            params,
            watch,
            Box::new(move |result| completer.complete(result_to_output(result))),
        );
        future
    }

    fn exec_raw(&self, query: String, params: Vec<Value>, watch: ReceiverWatch, cb: ResultFn) {
        let key = CacheKey { query, params };
        let mut entries = self.inner.entries.borrow_mut();
        match entries.get_mut(&key) {
            Some(CacheEntry::Done { result, .. }) => {
                log::debug!("cached data ready: {}", key.query);
                let result = result.clone();
                drop(entries);
                // deliver on the next turn of the event loop
                let mut cb = cb;
                tokio::task::spawn_local(async move {
                    if !watch.is_cancelled() {
                        cb(result);
                    }
                });
            }
            Some(CacheEntry::Pending(waiters)) => {
                log::debug!("data was requested already: {}", key.query);
                waiters.push(CacheWaiter { cb, watch });
            }
            None => {
                log::debug!("requesting data: {}", key.query);
                entries.insert(
                    key.clone(),
                    CacheEntry::Pending(vec![CacheWaiter { cb, watch }]),
                );
                drop(entries);
                let weak = Rc::downgrade(&self.inner);
                let completion_key = key.clone();
                self.inner.db.borrow().exec_raw(
                    crate::QueryKind::Raw(key.query),
                    key.params,
                    None,
                    Some(Box::new(move |result| {
                        if let Some(inner) = weak.upgrade() {
                            complete(&inner, &completion_key, result);
                        }
                    })),
                );
            }
        }
    }

    /// Removes an entry. Pending entries are only removed once every waiter
    /// has been cancelled. Returns whether something was removed.
    pub fn clear(&self, query: impl Into<String>, params: Vec<Value>) -> bool {
        let key = CacheKey {
            query: query.into(),
            params,
        };
        let mut entries = self.inner.entries.borrow_mut();
        let removable = match entries.get_mut(&key) {
            Some(CacheEntry::Done { .. }) => true,
            Some(CacheEntry::Pending(waiters)) => {
                waiters.retain(|w| !w.watch.is_cancelled());
                waiters.is_empty()
            }
            None => false,
        };
        if removable {
            log::debug!("clearing cache: {}", key.query);
            entries.remove(&key);
        }
        removable
    }

    /// Removes the entry only when it is older than `max_age`.
    pub fn expire(&self, max_age: Duration, query: impl Into<String>, params: Vec<Value>) -> bool {
        let key = CacheKey {
            query: query.into(),
            params,
        };
        let mut entries = self.inner.entries.borrow_mut();
        match entries.get(&key) {
            Some(CacheEntry::Done { created, .. }) if created.elapsed() > max_age => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Purges every completed entry older than `max_age`; returns how many
    /// were removed.
    pub fn expire_all(&self, max_age: Duration) -> usize {
        let mut entries = self.inner.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            CacheEntry::Done { created, .. } => created.elapsed() <= max_age,
            CacheEntry::Pending(..) => true,
        });
        before - entries.len()
    }

    /// Number of entries currently held, pending included.
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn complete(inner: &Rc<CacheInner>, key: &CacheKey, result: Rc<QueryResult>) {
    let discard = result.has_error() && !inner.cache_errors.get();
    let waiters = {
        let mut entries = inner.entries.borrow_mut();
        let Some(entry) = entries.get_mut(key) else {
            // cleared while in flight; nobody to notify
            return;
        };
        let waiters = match entry {
            CacheEntry::Pending(waiters) => std::mem::take(waiters),
            CacheEntry::Done { .. } => Vec::new(),
        };
        if discard {
            entries.remove(key);
        } else {
            entries.insert(
                key.clone(),
                CacheEntry::Done {
                    result: result.clone(),
                    created: Instant::now(),
                },
            );
        }
        waiters
    };
    log::debug!(
        "got request data, dispatching to {} receiver(s): {}",
        waiters.len(),
        key.query
    );
    for mut waiter in waiters {
        if !waiter.watch.is_cancelled() {
            (waiter.cb)(result.clone());
        }
    }
}

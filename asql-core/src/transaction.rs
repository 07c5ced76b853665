use crate::awaitable::result_to_output;
use crate::{Database, Error, QueryResult, Receiver, ReceiverWatch, Result, ResultFn};
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

/// Scoped transaction. Copies share the running flag; dropping the last copy
/// while the transaction is still running issues a `ROLLBACK` with no
/// callback, so an early return can never leave the connection inside an
/// open transaction.
#[derive(Clone)]
pub struct Transaction {
    d: Rc<TransactionInner>,
}

struct TransactionInner {
    db: Database,
    running: Cell<bool>,
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        if self.running.get() && self.db.is_valid() {
            log::info!("rolling back unfinished transaction");
            self.db.exec_raw("ROLLBACK".into(), Vec::new(), None, None);
        }
    }
}

impl Transaction {
    /// Wraps a database without sending anything; call [`Transaction::begin`].
    pub fn new(db: Database) -> Self {
        Self {
            d: Rc::new(TransactionInner {
                db,
                running: Cell::new(false),
            }),
        }
    }

    /// Sends `BEGIN` and awaits it, yielding a running transaction.
    pub async fn start(db: &Database) -> Result<Self> {
        db.execute("BEGIN", Vec::new()).await?;
        let transaction = Self::new(db.clone());
        transaction.d.running.set(true);
        Ok(transaction)
    }

    pub fn database(&self) -> Database {
        self.d.db.clone()
    }

    pub fn is_running(&self) -> bool {
        self.d.running.get()
    }

    pub fn begin(&self, receiver: Option<&Receiver>, cb: Option<ResultFn>) {
        if self.d.running.replace(true) {
            log::warn!("transaction already started");
            return;
        }
        self.d.db.exec_raw("BEGIN".into(), Vec::new(), receiver, cb);
    }

    pub fn commit(&self, receiver: Option<&Receiver>, cb: Option<ResultFn>) {
        if !self.d.running.replace(false) {
            log::warn!("transaction not started");
            return;
        }
        self.d.db.exec_raw("COMMIT".into(), Vec::new(), receiver, cb);
    }

    pub fn rollback(&self, receiver: Option<&Receiver>, cb: Option<ResultFn>) {
        if !self.d.running.replace(false) {
            log::warn!("transaction not started");
            return;
        }
        self.d
            .db
            .exec_raw("ROLLBACK".into(), Vec::new(), receiver, cb);
    }

    /// Awaitable commit; the transaction counts as finished even when the
    /// server reports an error.
    pub async fn commit_async(&self) -> Result<Rc<QueryResult>> {
        if !self.d.running.replace(false) {
            return Err(Error::Query("transaction not started".into()));
        }
        self.d.db.execute("COMMIT", Vec::new()).await
    }

    pub async fn rollback_async(&self) -> Result<Rc<QueryResult>> {
        if !self.d.running.replace(false) {
            return Err(Error::Query("transaction not started".into()));
        }
        self.d.db.execute("ROLLBACK", Vec::new()).await
    }
}

/// Callback of a [`CommitGuard`]: the finishing result plus whether the
/// guard rolled back instead of committing.
pub type CommitFn = Box<dyn FnMut(Rc<QueryResult>, bool)>;

/// Commit-biased transaction scope.
///
/// Where [`Transaction`] protects against forgetting to roll back,
/// `CommitGuard` expresses the opposite default: when the last copy drops
/// while running, `COMMIT` is issued unless [`CommitGuard::set_rollback`]
/// was called. Either way the completion callback passed at construction is
/// invoked with a `did_rollback` flag.
#[derive(Clone)]
pub struct CommitGuard {
    d: Rc<CommitGuardInner>,
}

struct CommitGuardInner {
    db: Database,
    watch: ReceiverWatch,
    cb: RefCell<Option<CommitFn>>,
    running: Cell<bool>,
    rollback: Cell<bool>,
}

impl Drop for CommitGuardInner {
    fn drop(&mut self) {
        if !self.running.get() || !self.db.is_valid() {
            return;
        }
        let did_rollback = self.rollback.get();
        let wrapped = self.cb.borrow_mut().take().map(|mut cb| -> ResultFn {
            let watch = self.watch.clone();
            Box::new(move |result| {
                if !watch.is_cancelled() {
                    cb(result, did_rollback);
                }
            })
        });
        let statement = if did_rollback {
            log::info!("rolling back transaction");
            "ROLLBACK"
        } else {
            log::info!("committing transaction");
            "COMMIT"
        };
        self.db
            .exec_raw(statement.into(), Vec::new(), None, wrapped);
    }
}

impl CommitGuard {
    pub fn new(db: Database, receiver: Option<&Receiver>, cb: Option<CommitFn>) -> Self {
        Self {
            d: Rc::new(CommitGuardInner {
                db,
                watch: receiver.into(),
                cb: RefCell::new(cb),
                running: Cell::new(false),
                rollback: Cell::new(false),
            }),
        }
    }

    /// Sends `BEGIN`; the guard becomes running only when it succeeds.
    pub fn begin(&self, receiver: Option<&Receiver>, mut cb: Option<ResultFn>) {
        if self.d.running.get() {
            log::warn!("transaction already started");
            return;
        }
        let inner = self.d.clone();
        self.d.db.exec_raw(
            "BEGIN".into(),
            Vec::new(),
            receiver,
            Some(Box::new(move |result: Rc<QueryResult>| {
                inner.running.set(!result.has_error());
                if let Some(cb) = cb.as_mut() {
                    cb(result);
                }
            })),
        );
    }

    /// Awaitable begin.
    pub async fn start(
        db: &Database,
        receiver: Option<&Receiver>,
        cb: Option<CommitFn>,
    ) -> Result<Self> {
        let guard = Self::new(db.clone(), receiver, cb);
        let (future, completer) = crate::awaitable::SingleShot::new(None);
        guard.begin(
            None,
            Some(Box::new(move |result| {
                completer.complete(result_to_output(result));
            })),
        );
        future.await?;
        Ok(guard)
    }

    /// Switches the drop action from commit to rollback.
    pub fn set_rollback(&self) {
        self.d.rollback.set(true);
    }

    pub fn is_rollback(&self) -> bool {
        self.d.rollback.get()
    }

    pub fn database(&self) -> Database {
        self.d.db.clone()
    }
}

//! Scriptable in-process driver for tests.
//!
//! `MockDriver` honors the driver contract (FIFO queue, prepare-once
//! bookkeeping, receiver suppression, the self-holding `Database` reference)
//! without any backend, and records every command it would have sent so
//! tests can assert on traffic. Completion is either scripted through a
//! handler (each submission answered synchronously) or driven manually with
//! [`MockDriver::complete_next`].

use crate::{
    ConnectionState, Database, Driver, OpenFn, QueryKind, QueryResult, Receiver, ReceiverWatch,
    ResultFn, StateFn, Value,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

type Handler = Box<dyn FnMut(&str, &[Value]) -> QueryResult>;

pub struct MockDriver {
    info: String,
    state: Cell<ConnectionState>,
    state_cb: RefCell<Option<StateFn>>,
    fail_connect: Cell<bool>,
    commands: RefCell<Vec<String>>,
    prepared: RefCell<HashSet<String>>,
    queue: RefCell<VecDeque<MockPending>>,
    handler: RefCell<Option<Handler>>,
    self_ref: RefCell<Option<Database>>,
    closed: Cell<bool>,
}

struct MockPending {
    cb: Option<ResultFn>,
    watch: ReceiverWatch,
}

impl MockDriver {
    pub fn create() -> Rc<Self> {
        Rc::new(Self {
            info: "mock://".into(),
            state: Cell::new(ConnectionState::Disconnected),
            state_cb: RefCell::new(None),
            fail_connect: Cell::new(false),
            commands: RefCell::new(Vec::new()),
            prepared: RefCell::new(HashSet::new()),
            queue: RefCell::new(VecDeque::new()),
            handler: RefCell::new(None),
            self_ref: RefCell::new(None),
            closed: Cell::new(false),
        })
    }

    /// Makes the next `open` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.set(fail);
    }

    /// Answers every submission synchronously with the handler's result.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(&str, &[Value]) -> QueryResult + 'static,
    {
        *self.handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Every command text submitted so far, PREPAREs included.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn command_count(&self, prefix: &str) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.get()
    }

    /// Delivers an intermediate result set to the oldest pending query
    /// without advancing the queue; the result is flagged as not last.
    pub fn deliver_partial(&self, mut result: QueryResult) -> bool {
        result.set_last_result_set(false);
        let entry = {
            let mut queue = self.queue.borrow_mut();
            let Some(pending) = queue.front_mut() else {
                return false;
            };
            if pending.watch.is_cancelled() {
                return false;
            }
            pending.cb.take()
        };
        let Some(mut cb) = entry else { return false };
        cb(Rc::new(result));
        if let Some(pending) = self.queue.borrow_mut().front_mut() {
            pending.cb = Some(cb);
        }
        true
    }

    /// Completes the oldest pending query with `result`. Returns whether the
    /// user callback was actually invoked (a dropped receiver suppresses it).
    pub fn complete_next(&self, result: QueryResult) -> bool {
        let Some(mut pending) = self.queue.borrow_mut().pop_front() else {
            return false;
        };
        if self.queue.borrow().is_empty() {
            self.self_ref.borrow_mut().take();
        }
        let delivered = !pending.watch.is_cancelled();
        if delivered
            && let Some(cb) = pending.cb.as_mut()
        {
            cb(Rc::new(result));
        }
        delivered && pending.cb.is_some()
    }

    pub fn complete_next_ok(&self) -> bool {
        self.complete_next(QueryResult::with_affected(0))
    }

    pub fn fail_next(&self, message: &str) -> bool {
        self.complete_next(QueryResult::with_error(message))
    }

    fn set_state(&self, state: ConnectionState, status: Option<&str>) {
        self.state.set(state);
        if let Some(cb) = self.state_cb.borrow_mut().as_mut() {
            cb(state, status);
        }
    }

    fn fail_queue(&self, error: &str) {
        loop {
            let Some(mut pending) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            if !pending.watch.is_cancelled()
                && let Some(cb) = pending.cb.as_mut()
            {
                cb(Rc::new(QueryResult::with_error(error)));
            }
        }
        self.self_ref.borrow_mut().take();
    }
}

impl Driver for MockDriver {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn connection_info(&self) -> &str {
        &self.info
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn open(&self, cb: Option<OpenFn>) {
        if self.fail_connect.get() {
            self.set_state(ConnectionState::Disconnected, Some("mock connect failure"));
            if let Some(cb) = cb {
                cb(Err(crate::Error::Connect("mock connect failure".into())));
            }
            return;
        }
        let was_connected = self.state.get() == ConnectionState::Connected;
        if !was_connected {
            self.set_state(ConnectionState::Connected, None);
        }
        if let Some(cb) = cb {
            cb(Ok(()));
        }
    }

    fn on_state_changed(&self, cb: Option<StateFn>) {
        *self.state_cb.borrow_mut() = cb;
    }

    fn exec(
        &self,
        db: &Database,
        query: QueryKind,
        params: Vec<Value>,
        receiver: Option<&Receiver>,
        cb: Option<ResultFn>,
    ) {
        let text = match &query {
            QueryKind::Raw(sql) => sql.clone(),
            QueryKind::Prepared(prepared) => {
                let id = prepared.identification().to_string();
                if self.prepared.borrow_mut().insert(id.clone()) {
                    self.commands
                        .borrow_mut()
                        .push(format!("PREPARE {id} AS {}", prepared.query()));
                }
                format!("EXECUTE {id}")
            }
        };
        self.commands.borrow_mut().push(text.clone());
        let watch = ReceiverWatch::from(receiver);
        let handled = self
            .handler
            .borrow_mut()
            .as_mut()
            .map(|handler| handler(&text, &params));
        match handled {
            Some(result) => {
                if !watch.is_cancelled()
                    && let Some(mut cb) = cb
                {
                    cb(Rc::new(result));
                }
            }
            None => {
                *self.self_ref.borrow_mut() = Some(db.clone());
                self.queue.borrow_mut().push_back(MockPending { cb, watch });
            }
        }
    }

    fn queue_size(&self) -> usize {
        self.queue.borrow().len()
    }

    fn close(&self) {
        self.closed.set(true);
        self.fail_queue("connection closed");
        self.set_state(ConnectionState::Disconnected, None);
    }
}

/// Factory producing [`MockDriver`]s and keeping track of every one it made.
#[derive(Default)]
pub struct MockFactory {
    drivers: RefCell<Vec<Rc<MockDriver>>>,
    fail_connect: Cell<bool>,
}

impl MockFactory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.set(fail);
    }

    pub fn created(&self) -> Vec<Rc<MockDriver>> {
        self.drivers.borrow().clone()
    }

    pub fn created_count(&self) -> usize {
        self.drivers.borrow().len()
    }

    pub fn closed_count(&self) -> usize {
        self.drivers.borrow().iter().filter(|d| d.was_closed()).count()
    }
}

impl crate::DriverFactory for MockFactory {
    fn create_driver(&self) -> Rc<dyn Driver> {
        let driver = MockDriver::create();
        driver.set_fail_connect(self.fail_connect.get());
        self.drivers.borrow_mut().push(driver.clone());
        driver
    }
}

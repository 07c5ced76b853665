use crate::worker::{
    ExecSql, OpenConfig, OwnedResult, WorkerCommand, WorkerEvent, worker_main,
};
use asql_core::{
    ColumnNames, ConnectionState, Database, Driver, Error, OpenFn, QueryKind, QueryResult,
    Receiver, ReceiverWatch, ResultFn, StateFn, Value,
};
use libsqlite3_sys::{
    SQLITE_OPEN_CREATE, SQLITE_OPEN_NOMUTEX, SQLITE_OPEN_PRIVATECACHE, SQLITE_OPEN_READONLY,
    SQLITE_OPEN_READWRITE, SQLITE_OPEN_SHAREDCACHE, SQLITE_OPEN_URI, sqlite3, sqlite3_interrupt,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Clone)]
struct SqliteQuery {
    id: u64,
    kind: QueryKind,
    params: Vec<Value>,
    cb: Rc<RefCell<Option<ResultFn>>>,
    watch: ReceiverWatch,
}

/// SQLite driver. The embedded backend has no asynchronous API, so the
/// driver owns one worker thread holding the connection and talks to it
/// over a queued-message channel; from the calling thread its behavior is
/// the same as any other driver. Pipeline mode, notifications and
/// single-row mode are not provided by this backend.
pub struct SqliteDriver {
    weak: Weak<SqliteDriver>,
    info: String,
    state: Cell<ConnectionState>,
    state_cb: RefCell<Option<StateFn>>,
    open_cbs: RefCell<Vec<OpenFn>>,
    queue: RefCell<VecDeque<SqliteQuery>>,
    running_id: Cell<Option<u64>>,
    next_query_id: Cell<u64>,
    commands: Option<flume::Sender<WorkerCommand>>,
    worker: RefCell<Option<std::thread::JoinHandle<()>>>,
    handle: Arc<AtomicPtr<sqlite3>>,
    self_ref: RefCell<Option<Database>>,
    wakeup: Rc<Notify>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    closed: Cell<bool>,
}

impl SqliteDriver {
    pub fn create(info: impl Into<String>) -> Rc<Self> {
        let (tx, rx) = flume::unbounded();
        let handle: Arc<AtomicPtr<sqlite3>> = Arc::new(AtomicPtr::new(ptr::null_mut()));
        let shared = handle.clone();
        let worker = std::thread::Builder::new()
            .name("asql-sqlite".into())
            .spawn(move || worker_main(rx, shared));
        let (worker, commands) = match worker {
            Ok(join) => (Some(join), Some(tx)),
            Err(error) => {
                log::error!("failed to spawn sqlite worker thread: {error}");
                (None, None)
            }
        };
        Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            info: info.into(),
            state: Cell::new(ConnectionState::Disconnected),
            state_cb: RefCell::new(None),
            open_cbs: RefCell::new(Vec::new()),
            queue: RefCell::new(VecDeque::new()),
            running_id: Cell::new(None),
            next_query_id: Cell::new(0),
            commands,
            worker: RefCell::new(worker),
            handle,
            self_ref: RefCell::new(None),
            wakeup: Rc::new(Notify::new()),
            tasks: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        })
    }

    fn set_state(&self, state: ConnectionState, status: Option<&str>) {
        self.state.set(state);
        let cb = self.state_cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(state, status);
            let mut slot = self.state_cb.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn fail_queue(&self, error: &str) {
        let mut failed = Vec::new();
        {
            let mut queue = self.queue.borrow_mut();
            while let Some(query) = queue.pop_front() {
                failed.push(query);
            }
        }
        for query in &failed {
            self.deliver(query, Rc::new(QueryResult::with_error(error)));
        }
        self.self_ref.borrow_mut().take();
    }

    fn deliver(&self, query: &SqliteQuery, result: Rc<QueryResult>) {
        if query.watch.is_cancelled() {
            return;
        }
        if let Some(cb) = query.cb.borrow_mut().as_mut() {
            cb(result);
        }
    }

    fn cancel_if_running(&self, id: u64) {
        if self.running_id.get() != Some(id) {
            return;
        }
        let handle = self.handle.load(Ordering::Acquire);
        if !handle.is_null() {
            unsafe {
                sqlite3_interrupt(handle);
            }
            log::debug!("interrupt requested");
        }
    }

    async fn process_queue(&self) {
        loop {
            if self.state.get() != ConnectionState::Connected {
                return;
            }
            let query = {
                let mut next = None;
                loop {
                    let mut queue = self.queue.borrow_mut();
                    let Some(front) = queue.front() else {
                        drop(queue);
                        self.self_ref.borrow_mut().take();
                        break;
                    };
                    if front.watch.is_cancelled() {
                        queue.pop_front();
                        continue;
                    }
                    next = Some(front.clone());
                    break;
                }
                match next {
                    Some(query) => query,
                    None => return,
                }
            };
            self.running_id.set(Some(query.id));
            self.run_query(&query).await;
            self.running_id.set(None);
            let mut queue = self.queue.borrow_mut();
            if queue.front().is_some_and(|front| front.id == query.id) {
                queue.pop_front();
            }
        }
    }

    async fn run_query(&self, query: &SqliteQuery) {
        let Some(commands) = &self.commands else {
            self.deliver(query, Rc::new(QueryResult::with_error("worker is gone")));
            return;
        };
        let sql = match &query.kind {
            QueryKind::Raw(sql) => ExecSql::Raw(sql.clone()),
            QueryKind::Prepared(prepared) => ExecSql::Prepared {
                id: prepared.identification().to_string(),
                sql: prepared.query().to_string(),
            },
        };
        let (tx, rx) = flume::unbounded();
        if commands
            .send(WorkerCommand::Exec {
                sql,
                params: query.params.clone(),
                reply: tx,
            })
            .is_err()
        {
            self.deliver(query, Rc::new(QueryResult::with_error("worker is gone")));
            return;
        }
        // one result is held back so the final one can carry the last flag
        let mut previous: Option<QueryResult> = None;
        while let Ok(event) = rx.recv_async().await {
            match event {
                WorkerEvent::Result(owned) => {
                    if let Some(mut earlier) = previous.take() {
                        earlier.set_last_result_set(false);
                        self.deliver(query, Rc::new(earlier));
                    }
                    previous = Some(into_result(owned));
                }
                WorkerEvent::Done => break,
            }
        }
        let last = previous.unwrap_or_else(|| QueryResult::with_affected(0));
        self.deliver(query, Rc::new(last));
    }
}

fn into_result(owned: OwnedResult) -> QueryResult {
    match owned.error {
        Some(error) => QueryResult::with_error(error),
        None => {
            let columns: ColumnNames = owned.columns.into();
            QueryResult::with_rows(columns, owned.rows, owned.affected)
        }
    }
}

/// Maps a `sqlite://` url onto the embedded backend's open flags.
/// `READONLY`, `SHAREDCACHE` and `URI` options select flags; `MEMORY`
/// without a file path yields an in-memory database.
fn parse_connection_info(info: &str) -> Result<OpenConfig, String> {
    let rest = info
        .strip_prefix("sqlite://")
        .ok_or_else(|| "sqlite connection url must start with sqlite://".to_string())?;
    let (raw_path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    let mut readonly = false;
    let mut shared_cache = false;
    let mut uri = false;
    let mut memory = false;
    if let Some(query) = query {
        for (key, _) in url::form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "READONLY" => readonly = true,
                "SHAREDCACHE" => shared_cache = true,
                "URI" => uri = true,
                "MEMORY" => memory = true,
                other => log::warn!("ignoring unknown sqlite option {other}"),
            }
        }
    }
    let path = urlencoding::decode(raw_path)
        .map_err(|e| format!("invalid database path: {e}"))?
        .into_owned();
    let path = if path.is_empty() {
        if memory {
            ":memory:".to_string()
        } else {
            return Err("no database path given".into());
        }
    } else {
        path
    };
    let mut flags = if readonly {
        SQLITE_OPEN_READONLY
    } else {
        SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE
    };
    flags |= if shared_cache {
        SQLITE_OPEN_SHAREDCACHE
    } else {
        SQLITE_OPEN_PRIVATECACHE
    };
    if uri {
        flags |= SQLITE_OPEN_URI;
    }
    flags |= SQLITE_OPEN_NOMUTEX;
    Ok(OpenConfig { path, flags })
}

async fn pump_task(weak: Weak<SqliteDriver>, wakeup: Rc<Notify>) {
    loop {
        {
            let Some(driver) = weak.upgrade() else { return };
            if driver.state.get() != ConnectionState::Connected {
                return;
            }
            driver.process_queue().await;
        }
        wakeup.notified().await;
    }
}

impl Driver for SqliteDriver {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn connection_info(&self) -> &str {
        &self.info
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn open(&self, cb: Option<OpenFn>) {
        match self.state.get() {
            ConnectionState::Connected => {
                if let Some(cb) = cb {
                    cb(Ok(()));
                }
            }
            ConnectionState::Connecting => {
                if let Some(cb) = cb {
                    self.open_cbs.borrow_mut().push(cb);
                }
            }
            ConnectionState::Disconnected => {
                if self.closed.get() {
                    if let Some(cb) = cb {
                        cb(Err(Error::Connect("driver is closed".into())));
                    }
                    return;
                }
                let config = match parse_connection_info(&self.info) {
                    Ok(config) => config,
                    Err(error) => {
                        log::error!("{error}");
                        if let Some(cb) = cb {
                            cb(Err(Error::Connect(error)));
                        }
                        return;
                    }
                };
                let Some(commands) = &self.commands else {
                    if let Some(cb) = cb {
                        cb(Err(Error::Connect("worker thread unavailable".into())));
                    }
                    return;
                };
                if let Some(cb) = cb {
                    self.open_cbs.borrow_mut().push(cb);
                }
                self.set_state(ConnectionState::Connecting, None);
                let (tx, rx) = flume::bounded(1);
                if commands
                    .send(WorkerCommand::Open { config, reply: tx })
                    .is_err()
                {
                    let error = "worker thread unavailable";
                    for cb in self.open_cbs.take() {
                        cb(Err(Error::Connect(error.into())));
                    }
                    self.set_state(ConnectionState::Disconnected, Some(error));
                    return;
                }
                let weak = self.weak.clone();
                let task = tokio::task::spawn_local(async move {
                    let outcome = rx.recv_async().await;
                    let Some(driver) = weak.upgrade() else { return };
                    match outcome {
                        Ok(Ok(())) => {
                            driver.set_state(ConnectionState::Connected, None);
                            for cb in driver.open_cbs.take() {
                                cb(Ok(()));
                            }
                            let wakeup = driver.wakeup.clone();
                            let weak = driver.weak.clone();
                            driver
                                .tasks
                                .borrow_mut()
                                .push(tokio::task::spawn_local(pump_task(weak, wakeup)));
                            driver.wakeup.notify_one();
                        }
                        Ok(Err(error)) => {
                            log::error!("{error}");
                            for cb in driver.open_cbs.take() {
                                cb(Err(Error::Connect(error.clone())));
                            }
                            driver.fail_queue(&error);
                            driver.set_state(ConnectionState::Disconnected, Some(&error));
                        }
                        Err(..) => {
                            let error = "worker thread exited";
                            for cb in driver.open_cbs.take() {
                                cb(Err(Error::Connect(error.into())));
                            }
                            driver.fail_queue(error);
                            driver.set_state(ConnectionState::Disconnected, Some(error));
                        }
                    }
                });
                self.tasks.borrow_mut().push(task);
            }
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
        if self.closed.get() {
            let watch = ReceiverWatch::from(receiver);
            if !watch.is_cancelled()
                && let Some(mut cb) = cb
            {
                cb(Rc::new(QueryResult::with_error("driver is closed")));
            }
            return;
        }
        let id = self.next_query_id.get() + 1;
        self.next_query_id.set(id);
        if let Some(receiver) = receiver {
            let weak = self.weak.clone();
            receiver.watch().on_drop(move || {
                if let Some(driver) = weak.upgrade() {
                    driver.cancel_if_running(id);
                }
            });
        }
        *self.self_ref.borrow_mut() = Some(db.clone());
        self.queue.borrow_mut().push_back(SqliteQuery {
            id,
            kind: query,
            params,
            cb: Rc::new(RefCell::new(cb)),
            watch: receiver.into(),
        });
        self.wakeup.notify_one();
    }

    fn queue_size(&self) -> usize {
        self.queue.borrow().len()
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for task in self.tasks.take() {
            task.abort();
        }
        // interrupt whatever is running so the worker can drain and exit
        let handle = self.handle.load(Ordering::Acquire);
        if !handle.is_null() {
            unsafe {
                sqlite3_interrupt(handle);
            }
        }
        if let Some(commands) = &self.commands {
            let _ = commands.send(WorkerCommand::Shutdown);
        }
        if let Some(worker) = self.worker.borrow_mut().take() {
            let _ = worker.join();
        }
        self.fail_queue("connection closed");
        self.set_state(ConnectionState::Disconnected, None);
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        if !self.closed.get() {
            for task in self.tasks.take() {
                task.abort();
            }
            if let Some(commands) = &self.commands {
                let _ = commands.send(WorkerCommand::Shutdown);
            }
            if let Some(worker) = self.worker.borrow_mut().take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_parsing() {
        let config = parse_connection_info("sqlite:///tmp/data.db").unwrap();
        assert_eq!(config.path, "/tmp/data.db");
        assert_eq!(
            config.flags,
            SQLITE_OPEN_READWRITE
                | SQLITE_OPEN_CREATE
                | SQLITE_OPEN_PRIVATECACHE
                | SQLITE_OPEN_NOMUTEX
        );
    }

    #[test]
    fn connection_info_options() {
        let config =
            parse_connection_info("sqlite:///tmp/data.db?READONLY&SHAREDCACHE&URI").unwrap();
        assert_eq!(
            config.flags,
            SQLITE_OPEN_READONLY
                | SQLITE_OPEN_SHAREDCACHE
                | SQLITE_OPEN_URI
                | SQLITE_OPEN_NOMUTEX
        );
    }

    #[test]
    fn memory_database_without_path() {
        let config = parse_connection_info("sqlite://?MEMORY").unwrap();
        assert_eq!(config.path, ":memory:");
    }

    #[test]
    fn missing_path_is_rejected() {
        assert!(parse_connection_info("sqlite://").is_err());
        assert!(parse_connection_info("file:///tmp/x.db").is_err());
    }

    #[test]
    fn percent_encoded_paths_are_decoded() {
        let config = parse_connection_info("sqlite:///tmp/my%20data.db").unwrap();
        assert_eq!(config.path, "/tmp/my data.db");
    }
}

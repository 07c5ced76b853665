use crate::params::{PgCell, PgParam, param_types};
use asql_core::{
    ColumnNames, ConnectionState, Database, Driver, Error, Notification, NotificationFn, OpenFn,
    PipelineStatus, PreparedQuery, QueryKind, QueryResult, Receiver, ReceiverWatch, ResultFn, Row,
    StateFn, Value,
};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};
use futures::stream::{FuturesOrdered, StreamExt};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_postgres::{
    AsyncMessage, CancelToken, Client, NoTls, SimpleQueryMessage, Socket, Statement,
    tls::NoTlsStream,
};

type PrepareShared = Shared<LocalBoxFuture<'static, Result<Statement, String>>>;

#[derive(Clone)]
enum PreparedState {
    Ready(Statement),
    Preparing(PrepareShared),
}

#[derive(Clone)]
struct PgQuery {
    id: u64,
    kind: QueryKind,
    params: Vec<Value>,
    cb: Rc<RefCell<Option<ResultFn>>>,
    watch: ReceiverWatch,
    single_row: Rc<Cell<bool>>,
}

enum QueueItem {
    Query(PgQuery),
    /// Pipeline synchronisation point; resolves once everything submitted
    /// before it has completed.
    Sync,
}

enum PipelineOutcome {
    Sync,
    Done {
        query: PgQuery,
        results: Vec<QueryResult>,
    },
}

/// Postgres driver: one physical connection multiplexing the enqueued
/// queries onto `tokio-postgres`, which provides the wire primitives.
///
/// All methods must be called on the thread (and `LocalSet`) that created
/// the driver; background work runs on local tasks.
pub struct PgDriver {
    weak: Weak<PgDriver>,
    info: String,
    state: Cell<ConnectionState>,
    state_cb: RefCell<Option<StateFn>>,
    open_cbs: RefCell<Vec<OpenFn>>,
    client: RefCell<Option<Rc<Client>>>,
    cancel_token: RefCell<Option<CancelToken>>,
    backend_pid: Cell<i32>,
    queue: RefCell<VecDeque<QueueItem>>,
    running: Cell<bool>,
    running_id: Cell<Option<u64>>,
    next_query_id: Cell<u64>,
    prepared: RefCell<HashMap<String, PreparedState>>,
    subscriptions: RefCell<HashMap<String, Rc<RefCell<NotificationFn>>>>,
    pipeline: Cell<PipelineStatus>,
    pipeline_inflight: Cell<usize>,
    sync_outstanding: Cell<u32>,
    self_ref: RefCell<Option<Database>>,
    wakeup: Rc<Notify>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl PgDriver {
    pub fn create(info: impl Into<String>) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            info: info.into(),
            state: Cell::new(ConnectionState::Disconnected),
            state_cb: RefCell::new(None),
            open_cbs: RefCell::new(Vec::new()),
            client: RefCell::new(None),
            cancel_token: RefCell::new(None),
            backend_pid: Cell::new(0),
            queue: RefCell::new(VecDeque::new()),
            running: Cell::new(false),
            running_id: Cell::new(None),
            next_query_id: Cell::new(0),
            prepared: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(HashMap::new()),
            pipeline: Cell::new(PipelineStatus::Off),
            pipeline_inflight: Cell::new(0),
            sync_outstanding: Cell::new(0),
            self_ref: RefCell::new(None),
            wakeup: Rc::new(Notify::new()),
            tasks: RefCell::new(Vec::new()),
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

    async fn connect_task(self: Rc<Self>) {
        log::debug!("open {}", self.info);
        match tokio_postgres::connect(&self.info, NoTls).await {
            Err(error) => {
                let error = error.to_string();
                log::error!("failed to connect: {error}");
                for cb in self.open_cbs.take() {
                    cb(Err(Error::Connect(error.clone())));
                }
                self.fail_queue(&error);
                self.set_state(ConnectionState::Disconnected, Some(&error));
            }
            Ok((client, connection)) => {
                let weak = self.weak.clone();
                self.tasks
                    .borrow_mut()
                    .push(tokio::task::spawn_local(connection_task(weak, connection)));
                let client = Rc::new(client);
                *self.cancel_token.borrow_mut() = Some(client.cancel_token());
                *self.client.borrow_mut() = Some(client.clone());
                // needed to flag self-originated notifications
                match client.query_one("SELECT pg_backend_pid()", &[]).await {
                    Ok(row) => self.backend_pid.set(row.get::<_, i32>(0)),
                    Err(error) => log::debug!("could not read backend pid: {error}"),
                }
                self.set_state(ConnectionState::Connected, None);
                for cb in self.open_cbs.take() {
                    cb(Ok(()));
                }
                let weak = self.weak.clone();
                let wakeup = self.wakeup.clone();
                self.tasks
                    .borrow_mut()
                    .push(tokio::task::spawn_local(pump_task(weak, wakeup)));
                self.wakeup.notify_one();
            }
        }
    }

    fn connection_lost(&self, error: &str) {
        log::error!("connection lost: {error}");
        self.teardown();
        self.fail_queue(error);
        self.set_state(ConnectionState::Disconnected, Some(error));
    }

    /// Stops background work and forgets every piece of per-connection
    /// state; subscriptions and prepared statements do not survive.
    fn teardown(&self) {
        for task in self.tasks.take() {
            task.abort();
        }
        self.client.borrow_mut().take();
        self.cancel_token.borrow_mut().take();
        self.prepared.borrow_mut().clear();
        self.subscriptions.borrow_mut().clear();
        self.pipeline.set(PipelineStatus::Off);
        self.pipeline_inflight.set(0);
        self.sync_outstanding.set(0);
        self.running.set(false);
        self.running_id.set(None);
    }

    fn fail_queue(&self, error: &str) {
        let mut failed = Vec::new();
        {
            let mut queue = self.queue.borrow_mut();
            while let Some(item) = queue.pop_front() {
                if let QueueItem::Query(query) = item {
                    failed.push(query);
                }
            }
        }
        for query in &failed {
            self.deliver(query, Rc::new(QueryResult::with_error(error)));
        }
        self.self_ref.borrow_mut().take();
    }

    fn dispatch_notification(&self, notification: tokio_postgres::Notification) {
        let channel = notification.channel();
        let cb = self.subscriptions.borrow().get(channel).cloned();
        match cb {
            Some(cb) => {
                let note = Notification {
                    channel: channel.to_string(),
                    payload: notification.payload().to_string(),
                    self_origin: notification.process_id() == self.backend_pid.get(),
                };
                (cb.borrow_mut())(&note);
            }
            None => {
                log::warn!("received notification for '{channel}' which isn't subscribed to")
            }
        }
    }

    fn cancel_if_running(&self, id: u64) {
        if self.running_id.get() != Some(id) {
            return;
        }
        let Some(token) = self.cancel_token.borrow().clone() else {
            return;
        };
        tokio::task::spawn_local(async move {
            match token.cancel_query(NoTls).await {
                Ok(()) => log::debug!("cancel request sent"),
                Err(error) => log::debug!("cancel request failed: {error}"),
            }
        });
    }

    fn deliver(&self, query: &PgQuery, result: Rc<QueryResult>) {
        if query.watch.is_cancelled() {
            return;
        }
        if let Some(cb) = query.cb.borrow_mut().as_mut() {
            cb(result);
        }
    }

    fn deliver_error(&self, query: &PgQuery, error: &str) {
        self.deliver(query, Rc::new(QueryResult::with_error(error)));
    }

    /// Fans a submission's result sets out to the callback, expanding them
    /// per row first when single-row mode was requested.
    fn deliver_sets(&self, query: &PgQuery, sets: Vec<QueryResult>) {
        let out = if query.single_row.get() {
            let affected = sets.last().map(QueryResult::rows_affected).unwrap_or(0);
            let mut out: Vec<QueryResult> = sets
                .into_iter()
                .flat_map(QueryResult::into_single_rows)
                .collect();
            out.push(QueryResult::with_affected(affected));
            out
        } else {
            sets
        };
        let total = out.len();
        for (i, mut set) in out.into_iter().enumerate() {
            set.set_last_result_set(i + 1 == total);
            self.deliver(query, Rc::new(set));
        }
    }

    async fn process_queue(&self) {
        loop {
            if self.pipeline.get() != PipelineStatus::Off
                || self.state.get() != ConnectionState::Connected
            {
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
                    let runnable = match front {
                        QueueItem::Sync => None,
                        QueueItem::Query(q) if q.watch.is_cancelled() => None,
                        QueueItem::Query(q) => Some(q.clone()),
                    };
                    match runnable {
                        Some(q) => {
                            next = Some(q);
                            break;
                        }
                        None => {
                            queue.pop_front();
                        }
                    }
                }
                match next {
                    Some(q) => q,
                    None => return,
                }
            };
            self.running.set(true);
            self.running_id.set(Some(query.id));
            self.run_query(&query).await;
            self.running.set(false);
            self.running_id.set(None);
            // pop unless the failing connection already drained the queue
            let mut queue = self.queue.borrow_mut();
            if let Some(QueueItem::Query(front)) = queue.front()
                && front.id == query.id
            {
                queue.pop_front();
            }
        }
    }

    async fn run_query(&self, query: &PgQuery) {
        let Some(client) = self.client.borrow().clone() else {
            self.deliver_error(query, "connection is gone");
            return;
        };
        match &query.kind {
            QueryKind::Raw(sql) if query.params.is_empty() => {
                self.run_simple(query, &client, sql).await;
            }
            QueryKind::Raw(sql) => {
                match client.prepare_typed(sql, &param_types(&query.params)).await {
                    Ok(statement) => self.run_extended(query, &client, &statement).await,
                    Err(error) => self.deliver_error(query, &error.to_string()),
                }
            }
            QueryKind::Prepared(prepared) => {
                match self.statement_for(&client, prepared, &query.params).await {
                    Ok(statement) => self.run_extended(query, &client, &statement).await,
                    Err(error) => self.deliver_error(query, &error),
                }
            }
        }
    }

    /// Prepares the handle's statement at most once per connection; the
    /// identifier keys the prepared set.
    async fn statement_for(
        &self,
        client: &Rc<Client>,
        prepared: &PreparedQuery,
        params: &[Value],
    ) -> Result<Statement, String> {
        let id = prepared.identification().to_string();
        let state = self.prepared.borrow().get(&id).cloned();
        match state {
            Some(PreparedState::Ready(statement)) => Ok(statement),
            Some(PreparedState::Preparing(shared)) => {
                let result = shared.await;
                if let Ok(statement) = &result {
                    self.prepared
                        .borrow_mut()
                        .insert(id, PreparedState::Ready(statement.clone()));
                }
                result
            }
            None => {
                log::debug!("preparing statement {id}");
                match client
                    .prepare_typed(prepared.query(), &param_types(params))
                    .await
                {
                    Ok(statement) => {
                        self.prepared
                            .borrow_mut()
                            .insert(id, PreparedState::Ready(statement.clone()));
                        Ok(statement)
                    }
                    Err(error) => Err(error.to_string()),
                }
            }
        }
    }

    /// Simple-query protocol: multi-statement text, text-format results.
    async fn run_simple(&self, query: &PgQuery, client: &Client, sql: &str) {
        match client.simple_query(sql).await {
            Err(error) => self.deliver_error(query, &error.to_string()),
            Ok(messages) => self.deliver_sets(query, partition_simple(messages)),
        }
    }

    /// Extended protocol: binary parameters, streamed rows. Single-row mode
    /// delivers each row as it arrives.
    async fn run_extended(&self, query: &PgQuery, client: &Client, statement: &Statement) {
        let params: Vec<PgParam> = query.params.iter().cloned().map(PgParam).collect();
        match client.query_raw(statement, params).await {
            Err(error) => self.deliver_error(query, &error.to_string()),
            Ok(stream) => {
                let columns: ColumnNames = statement
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let mut stream = pin!(stream);
                let single_row = query.single_row.get();
                let mut rows: Vec<Row> = Vec::new();
                let mut failure = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(row) => {
                            if single_row {
                                let mut set = QueryResult::with_rows(
                                    columns.clone(),
                                    vec![row_values(&row)],
                                    0,
                                );
                                set.set_last_result_set(false);
                                self.deliver(query, Rc::new(set));
                            } else {
                                rows.push(row_values(&row));
                            }
                        }
                        Err(error) => {
                            failure = Some(error.to_string());
                            break;
                        }
                    }
                }
                match failure {
                    Some(error) => self.deliver_error(query, &error),
                    None => {
                        let affected = stream.rows_affected().unwrap_or(0);
                        let result = if single_row {
                            QueryResult::with_affected(affected)
                        } else {
                            QueryResult::with_rows(columns, rows, affected)
                        };
                        self.deliver(query, Rc::new(result));
                    }
                }
            }
        }
    }

    async fn process_pipeline(&self) {
        let mut jobs: FuturesOrdered<LocalBoxFuture<'_, PipelineOutcome>> = FuturesOrdered::new();
        loop {
            loop {
                let item = self.queue.borrow_mut().pop_front();
                match item {
                    None => break,
                    Some(QueueItem::Sync) => {
                        jobs.push_back(async { PipelineOutcome::Sync }.boxed_local());
                    }
                    Some(QueueItem::Query(query)) => {
                        if query.watch.is_cancelled() {
                            continue;
                        }
                        self.pipeline_inflight.set(self.pipeline_inflight.get() + 1);
                        jobs.push_back(
                            async move {
                                let results = self.execute_collect(&query).await;
                                PipelineOutcome::Done { query, results }
                            }
                            .boxed_local(),
                        );
                    }
                }
            }
            if self.state.get() != ConnectionState::Connected {
                return;
            }
            if jobs.is_empty() {
                if self.pipeline.get() != PipelineStatus::On && self.queue.borrow().is_empty() {
                    return;
                }
                self.self_ref.borrow_mut().take();
                self.wakeup.notified().await;
                continue;
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                outcome = jobs.next() => match outcome {
                    Some(PipelineOutcome::Sync) => {
                        let outstanding = self.sync_outstanding.get();
                        self.sync_outstanding.set(outstanding.saturating_sub(1));
                    }
                    Some(PipelineOutcome::Done { query, results }) => {
                        self.pipeline_inflight.set(self.pipeline_inflight.get() - 1);
                        self.deliver_sets(&query, results);
                    }
                    None => {}
                },
            }
        }
    }

    /// Pipeline-side execution: results are buffered so completions can be
    /// surfaced strictly in submission order.
    async fn execute_collect(&self, query: &PgQuery) -> Vec<QueryResult> {
        let Some(client) = self.client.borrow().clone() else {
            return vec![QueryResult::with_error("connection is gone")];
        };
        match &query.kind {
            QueryKind::Raw(sql) if query.params.is_empty() => {
                match client.simple_query(sql).await {
                    Err(error) => vec![QueryResult::with_error(error.to_string())],
                    Ok(messages) => partition_simple(messages),
                }
            }
            QueryKind::Raw(sql) => {
                match client.prepare_typed(sql, &param_types(&query.params)).await {
                    Err(error) => vec![QueryResult::with_error(error.to_string())],
                    Ok(statement) => collect_extended(&client, &statement, &query.params).await,
                }
            }
            QueryKind::Prepared(prepared) => {
                match self
                    .statement_for_pipeline(&client, prepared, &query.params)
                    .await
                {
                    Err(error) => vec![QueryResult::with_error(error)],
                    Ok(statement) => collect_extended(&client, &statement, &query.params).await,
                }
            }
        }
    }

    /// In pipeline mode the statement is optimistically marked as prepared
    /// while the PREPARE is still in flight, so dependent executes queue up
    /// behind the shared future instead of serialising. If the PREPARE
    /// fails, every dependent execute fails through its own callback.
    async fn statement_for_pipeline(
        &self,
        client: &Rc<Client>,
        prepared: &PreparedQuery,
        params: &[Value],
    ) -> Result<Statement, String> {
        let id = prepared.identification().to_string();
        let state = self.prepared.borrow().get(&id).cloned();
        match state {
            Some(PreparedState::Ready(statement)) => Ok(statement),
            Some(PreparedState::Preparing(shared)) => shared.await,
            None => {
                log::debug!("preparing statement {id} (pipelined)");
                let owned_client = client.clone();
                let sql = prepared.query().to_string();
                let types = param_types(params);
                let future: PrepareShared = async move {
                    owned_client
                        .prepare_typed(&sql, &types)
                        .await
                        .map_err(|e| e.to_string())
                }
                .boxed_local()
                .shared();
                self.prepared
                    .borrow_mut()
                    .insert(id.clone(), PreparedState::Preparing(future.clone()));
                let result = future.await;
                if let Ok(statement) = &result {
                    self.prepared
                        .borrow_mut()
                        .insert(id, PreparedState::Ready(statement.clone()));
                }
                result
            }
        }
    }
}

async fn collect_extended(client: &Client, statement: &Statement, params: &[Value]) -> Vec<QueryResult> {
    let params: Vec<PgParam> = params.iter().cloned().map(PgParam).collect();
    match client.query_raw(statement, params).await {
        Err(error) => vec![QueryResult::with_error(error.to_string())],
        Ok(stream) => {
            let columns: ColumnNames = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            let mut stream = pin!(stream);
            let mut rows = Vec::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(row) => rows.push(row_values(&row)),
                    Err(error) => return vec![QueryResult::with_error(error.to_string())],
                }
            }
            let affected = stream.rows_affected().unwrap_or(0);
            vec![QueryResult::with_rows(columns, rows, affected)]
        }
    }
}

fn row_values(row: &tokio_postgres::Row) -> Row {
    (0..row.len())
        .map(|i| match row.try_get::<_, PgCell>(i) {
            Ok(cell) => cell.0,
            Err(error) => {
                log::warn!(
                    "could not decode column {i} `{}`: {error}",
                    row.columns()[i].name()
                );
                Value::Null
            }
        })
        .collect()
}

fn simple_row_values(row: &tokio_postgres::SimpleQueryRow) -> Row {
    (0..row.len())
        .map(|i| match row.try_get(i) {
            Ok(Some(text)) => Value::Text(text.to_string()),
            _ => Value::Null,
        })
        .collect()
}

/// Splits a simple-query message stream into one result per statement.
fn partition_simple(messages: Vec<SimpleQueryMessage>) -> Vec<QueryResult> {
    let mut sets = Vec::new();
    let mut columns: Option<ColumnNames> = None;
    let mut rows: Vec<Row> = Vec::new();
    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(description) => {
                columns = Some(
                    description
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect(),
                );
            }
            SimpleQueryMessage::Row(row) => rows.push(simple_row_values(&row)),
            SimpleQueryMessage::CommandComplete(affected) => {
                sets.push(QueryResult::with_rows(
                    columns.take().unwrap_or_default(),
                    std::mem::take(&mut rows),
                    affected,
                ));
            }
            _ => {}
        }
    }
    if sets.is_empty() {
        sets.push(QueryResult::with_affected(0));
    }
    sets
}

async fn connection_task(
    weak: Weak<PgDriver>,
    mut connection: tokio_postgres::Connection<Socket, NoTlsStream>,
) {
    loop {
        let message = futures::future::poll_fn(|cx| connection.poll_message(cx)).await;
        let Some(driver) = weak.upgrade() else { return };
        match message {
            Some(Ok(AsyncMessage::Notification(notification))) => {
                driver.dispatch_notification(notification);
            }
            Some(Ok(..)) => {}
            Some(Err(error)) => {
                driver.connection_lost(&error.to_string());
                return;
            }
            None => {
                driver.connection_lost("connection closed");
                return;
            }
        }
    }
}

/// Drives the queue. Holds only a weak driver reference between rounds so an
/// abandoned driver can actually drop.
async fn pump_task(weak: Weak<PgDriver>, wakeup: Rc<Notify>) {
    loop {
        {
            let Some(driver) = weak.upgrade() else { return };
            if driver.state.get() != ConnectionState::Connected {
                return;
            }
            if driver.pipeline.get() == PipelineStatus::On {
                driver.process_pipeline().await;
            } else {
                driver.process_queue().await;
            }
            if driver.state.get() != ConnectionState::Connected {
                return;
            }
        }
        wakeup.notified().await;
    }
}

impl Driver for PgDriver {
    fn backend_name(&self) -> &'static str {
        "postgres"
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
                if !self.info.starts_with("postgres://")
                    && !self.info.starts_with("postgresql://")
                {
                    let error = Error::Connect(
                        "postgres connection url must start with postgres:// or postgresql://"
                            .into(),
                    );
                    log::error!("{error}");
                    if let Some(cb) = cb {
                        cb(Err(error));
                    }
                    return;
                }
                if let Some(cb) = cb {
                    self.open_cbs.borrow_mut().push(cb);
                }
                self.set_state(ConnectionState::Connecting, None);
                let weak = self.weak.clone();
                let task = tokio::task::spawn_local(async move {
                    let Some(driver) = weak.upgrade() else { return };
                    driver.connect_task().await;
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
        self.queue.borrow_mut().push_back(QueueItem::Query(PgQuery {
            id,
            kind: query,
            params,
            cb: Rc::new(RefCell::new(cb)),
            watch: receiver.into(),
            single_row: Rc::new(Cell::new(false)),
        }));
        self.wakeup.notify_one();
    }

    fn set_last_query_single_row_mode(&self) {
        let queue = self.queue.borrow();
        // with a single entry this is the running query
        for item in queue.iter().rev() {
            if let QueueItem::Query(query) = item {
                query.single_row.set(true);
                return;
            }
        }
    }

    fn enter_pipeline_mode(&self, auto_sync: Option<Duration>) -> bool {
        if self.state.get() != ConnectionState::Connected
            || self.pipeline.get() == PipelineStatus::On
            || self.running.get()
            || !self.queue.borrow().is_empty()
        {
            return false;
        }
        self.pipeline.set(PipelineStatus::On);
        if let Some(interval) = auto_sync {
            let weak = self.weak.clone();
            let task = tokio::task::spawn_local(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(driver) = weak.upgrade() else { return };
                    if driver.pipeline.get() != PipelineStatus::On {
                        return;
                    }
                    if driver.pipeline_inflight.get() > 0 && driver.sync_outstanding.get() == 0 {
                        driver.pipeline_sync();
                    }
                }
            });
            self.tasks.borrow_mut().push(task);
        }
        self.wakeup.notify_one();
        true
    }

    fn exit_pipeline_mode(&self) -> bool {
        if self.pipeline.get() == PipelineStatus::On
            && self.pipeline_inflight.get() == 0
            && self.queue.borrow().is_empty()
        {
            self.pipeline.set(PipelineStatus::Off);
            self.wakeup.notify_one();
            true
        } else {
            false
        }
    }

    fn pipeline_status(&self) -> PipelineStatus {
        self.pipeline.get()
    }

    fn pipeline_sync(&self) -> bool {
        if self.pipeline.get() != PipelineStatus::On {
            return false;
        }
        self.sync_outstanding.set(self.sync_outstanding.get() + 1);
        self.queue.borrow_mut().push_back(QueueItem::Sync);
        self.wakeup.notify_one();
        true
    }

    fn subscribe_to_notification(
        &self,
        db: &Database,
        channel: &str,
        receiver: Option<&Receiver>,
        cb: NotificationFn,
    ) {
        if self.subscriptions.borrow().contains_key(channel) {
            log::warn!("already subscribed to notification {channel}");
            return;
        }
        self.subscriptions
            .borrow_mut()
            .insert(channel.to_string(), Rc::new(RefCell::new(cb)));
        let weak = self.weak.clone();
        let name = channel.to_string();
        self.exec(
            db,
            QueryKind::Raw(format!("LISTEN {}", quote_identifier(channel))),
            Vec::new(),
            receiver,
            Some(Box::new(move |result: Rc<QueryResult>| {
                log::debug!(
                    "subscribed {}: {}",
                    !result.has_error(),
                    result.error_string()
                );
                if result.has_error()
                    && let Some(driver) = weak.upgrade()
                {
                    driver.subscriptions.borrow_mut().remove(&name);
                }
            })),
        );
        if let Some(receiver) = receiver {
            let weak = self.weak.clone();
            let name = channel.to_string();
            receiver.watch().on_drop(move || {
                if let Some(driver) = weak.upgrade() {
                    driver.subscriptions.borrow_mut().remove(&name);
                }
            });
        }
    }

    fn unsubscribe_from_notification(&self, db: &Database, channel: &str) {
        if self.subscriptions.borrow_mut().remove(channel).is_some() {
            self.exec(
                db,
                QueryKind::Raw(format!("UNLISTEN {}", quote_identifier(channel))),
                Vec::new(),
                None,
                Some(Box::new(|result: Rc<QueryResult>| {
                    log::debug!(
                        "unsubscribed {}: {}",
                        !result.has_error(),
                        result.error_string()
                    );
                })),
            );
        }
    }

    fn subscribed_to_notifications(&self) -> Vec<String> {
        self.subscriptions.borrow().keys().cloned().collect()
    }

    fn queue_size(&self) -> usize {
        self.queue
            .borrow()
            .iter()
            .filter(|item| matches!(item, QueueItem::Query(..)))
            .count()
    }

    fn close(&self) {
        self.teardown();
        self.fail_queue("connection closed");
        self.set_state(ConnectionState::Disconnected, None);
    }
}

impl Drop for PgDriver {
    fn drop(&mut self) {
        for task in self.tasks.take() {
            task.abort();
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

use crate::{Database, Error, PreparedQuery, QueryResult, Receiver, Result, Value};
use std::rc::Rc;
use std::time::Duration;

/// Connection lifecycle of a [`Driver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Pipeline mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineStatus {
    #[default]
    Off,
    On,
    /// The connection saw an error while in pipeline mode.
    Aborted,
}

/// Asynchronous notification delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Whether this connection's own backend originated the notification.
    pub self_origin: bool,
}

pub type OpenFn = Box<dyn FnOnce(Result<()>)>;
pub type StateFn = Box<dyn FnMut(ConnectionState, Option<&str>)>;
/// Result callback; invoked once per result set of a submission.
pub type ResultFn = Box<dyn FnMut(Rc<QueryResult>)>;
pub type NotificationFn = Box<dyn FnMut(&Notification)>;

/// The text of a submission: raw SQL or a prepared-statement handle.
#[derive(Debug, Clone)]
pub enum QueryKind {
    Raw(String),
    Prepared(PreparedQuery),
}

impl QueryKind {
    /// The SQL text behind this submission, for logging.
    pub fn text(&self) -> &str {
        match self {
            QueryKind::Raw(sql) => sql,
            QueryKind::Prepared(p) => p.query(),
        }
    }
}

impl From<&str> for QueryKind {
    fn from(value: &str) -> Self {
        QueryKind::Raw(value.into())
    }
}

impl From<String> for QueryKind {
    fn from(value: String) -> Self {
        QueryKind::Raw(value)
    }
}

impl From<&PreparedQuery> for QueryKind {
    fn from(value: &PreparedQuery) -> Self {
        QueryKind::Prepared(value.clone())
    }
}

impl From<PreparedQuery> for QueryKind {
    fn from(value: PreparedQuery) -> Self {
        QueryKind::Prepared(value)
    }
}

/// Client-side state for a single physical connection.
///
/// Exactly one backend connection per driver. Drivers are thread-confined:
/// every method must be called on the thread (and local task set) that
/// created the driver. Queued queries run FIFO outside pipeline mode and
/// callbacks fire in submission order.
///
/// Backends implement this trait; `asql-postgres` and `asql-sqlite` are the
/// shipped implementations and [`crate::mock::MockDriver`] backs tests.
pub trait Driver {
    /// Short stable backend identifier (`"postgres"`, `"sqlite"`, …).
    fn backend_name(&self) -> &'static str;

    fn connection_info(&self) -> &str;

    fn state(&self) -> ConnectionState;

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Starts the handshake. The callback resolves exactly once. Calling
    /// `open` on a connected driver resolves immediately; while connecting,
    /// the callback is queued behind the in-flight handshake.
    fn open(&self, cb: Option<OpenFn>);

    /// Registers the single state observer; overwritten on re-registration.
    fn on_state_changed(&self, cb: Option<StateFn>);

    /// Enqueues a query. `db` is the handle the submission came through; the
    /// driver keeps it alive until its queue drains so a pooled connection
    /// is never released mid-queue.
    fn exec(
        &self,
        db: &Database,
        query: QueryKind,
        params: Vec<Value>,
        receiver: Option<&Receiver>,
        cb: Option<ResultFn>,
    );

    /// Requests per-row delivery for the most recently enqueued (or running)
    /// query. Backends without row-by-row delivery ignore it.
    fn set_last_query_single_row_mode(&self) {}

    /// Only permitted while connected with an empty queue. Returns whether
    /// pipeline mode was entered.
    fn enter_pipeline_mode(&self, auto_sync: Option<Duration>) -> bool {
        let _ = auto_sync;
        false
    }

    fn exit_pipeline_mode(&self) -> bool {
        false
    }

    fn pipeline_status(&self) -> PipelineStatus {
        PipelineStatus::Off
    }

    fn pipeline_sync(&self) -> bool {
        false
    }

    fn subscribe_to_notification(
        &self,
        db: &Database,
        channel: &str,
        receiver: Option<&Receiver>,
        cb: NotificationFn,
    ) {
        let _ = (db, channel, receiver, cb);
        log::warn!(
            "{} driver does not support notifications",
            self.backend_name()
        );
    }

    fn unsubscribe_from_notification(&self, db: &Database, channel: &str) {
        let _ = (db, channel);
    }

    fn subscribed_to_notifications(&self) -> Vec<String> {
        Vec::new()
    }

    fn queue_size(&self) -> usize;

    /// Tears the connection down: pending queries fail, background work
    /// stops and the state becomes `Disconnected`.
    fn close(&self);
}

/// Factory registered with the [`crate::Pool`]; one per connection string.
pub trait DriverFactory {
    fn create_driver(&self) -> Rc<dyn Driver>;

    fn create_database(&self) -> Database {
        Database::new(self.create_driver())
    }
}

/// Builds the error result every driver delivers when a submission cannot
/// be attempted at all.
pub fn invalid_driver_result() -> Rc<QueryResult> {
    Rc::new(QueryResult::from_error(Error::InvalidDriver))
}

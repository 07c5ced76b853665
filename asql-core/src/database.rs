use crate::awaitable::{ConnectFuture, ExecFuture, ResultStream, connect_future, exec_future, stream_future};
use crate::pool::PoolLease;
use crate::{
    ConnectionState, Driver, Notification, PipelineStatus, QueryKind, QueryResult, Receiver,
    Result, ResultFn, Value, invalid_driver_result,
};
use std::rc::Rc;
use std::time::Duration;

/// Shared handle to one [`Driver`].
///
/// Cheap to clone; all copies refer to the same physical connection. A
/// default-constructed handle is *invalid*: every submission through it is
/// answered synchronously with an `InvalidDriver` error result.
#[derive(Clone, Default)]
pub struct Database {
    driver: Option<Rc<dyn Driver>>,
    // held for its Drop: the last copy returns the driver to its pool
    _lease: Option<Rc<PoolLease>>,
}

impl Database {
    pub fn new(driver: Rc<dyn Driver>) -> Self {
        Self {
            driver: Some(driver),
            _lease: None,
        }
    }

    pub(crate) fn pooled(driver: Rc<dyn Driver>, lease: Rc<PoolLease>) -> Self {
        Self {
            driver: Some(driver),
            _lease: Some(lease),
        }
    }

    /// Whether this handle has a backing driver.
    pub fn is_valid(&self) -> bool {
        self.driver.is_some()
    }

    pub fn driver(&self) -> Option<&Rc<dyn Driver>> {
        self.driver.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.driver
            .as_ref()
            .map(|d| d.state())
            .unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens the connection; the callback fires once the handshake resolves.
    pub fn open<F>(&self, cb: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        match &self.driver {
            Some(d) => d.open(Some(Box::new(cb))),
            None => cb(Err(crate::Error::InvalidDriver)),
        }
    }

    pub(crate) fn open_quiet(&self) {
        if let Some(d) = &self.driver {
            d.open(None);
        }
    }

    /// Awaitable form of [`Database::open`].
    pub fn connect(&self) -> ConnectFuture {
        connect_future(self)
    }

    /// Registers the single state observer for the underlying driver.
    pub fn on_state_changed<F>(&self, cb: F)
    where
        F: FnMut(ConnectionState, Option<&str>) + 'static,
    {
        if let Some(d) = &self.driver {
            d.on_state_changed(Some(Box::new(cb)));
        }
    }

    /// Executes a query without parameters.
    ///
    /// Multi-statement text is allowed; the callback then fires once per
    /// statement and only the final invocation sees
    /// [`QueryResult::last_result_set`].
    pub fn exec<F>(&self, query: impl Into<QueryKind>, cb: F)
    where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw(query.into(), Vec::new(), None, Some(Box::new(cb)));
    }

    /// Executes a parameterised query with an optional cancellation scope.
    /// Parameterised submissions are limited to a single statement.
    pub fn exec_with<F>(
        &self,
        query: impl Into<QueryKind>,
        params: Vec<Value>,
        receiver: Option<&Receiver>,
        cb: F,
    ) where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw(query.into(), params, receiver, Some(Box::new(cb)));
    }

    /// Callback-free / boxed form every other exec method funnels into.
    pub fn exec_raw(
        &self,
        query: QueryKind,
        params: Vec<Value>,
        receiver: Option<&Receiver>,
        cb: Option<ResultFn>,
    ) {
        match &self.driver {
            Some(d) => d.exec(self, query, params, receiver, cb),
            None => {
                log::warn!("exec on an invalid database handle");
                if let Some(mut cb) = cb {
                    cb(invalid_driver_result());
                }
            }
        }
    }

    /// Awaitable single-shot execution; resolves with the first result set.
    /// Dropping the returned future cancels the query.
    pub fn execute(&self, query: impl Into<QueryKind>, params: Vec<Value>) -> ExecFuture {
        exec_future(self, query.into(), params)
    }

    /// Awaitable multi-shot execution; the stream yields every result set of
    /// the submission and ends after the one flagged `last_result_set`.
    pub fn execute_stream(&self, query: impl Into<QueryKind>, params: Vec<Value>) -> ResultStream {
        stream_future(self, query.into(), params)
    }

    pub fn begin<F>(&self, receiver: Option<&Receiver>, cb: F)
    where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw("BEGIN".into(), Vec::new(), receiver, Some(Box::new(cb)));
    }

    pub fn commit<F>(&self, receiver: Option<&Receiver>, cb: F)
    where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw("COMMIT".into(), Vec::new(), receiver, Some(Box::new(cb)));
    }

    pub fn rollback<F>(&self, receiver: Option<&Receiver>, cb: F)
    where
        F: FnMut(Rc<QueryResult>) + 'static,
    {
        self.exec_raw("ROLLBACK".into(), Vec::new(), receiver, Some(Box::new(cb)));
    }

    /// Flags the most recently enqueued (or running) query for per-row
    /// delivery: each row arrives as its own result set.
    pub fn set_last_query_single_row_mode(&self) {
        if let Some(d) = &self.driver {
            d.set_last_query_single_row_mode();
        }
    }

    pub fn enter_pipeline_mode(&self, auto_sync: Option<Duration>) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|d| d.enter_pipeline_mode(auto_sync))
    }

    pub fn exit_pipeline_mode(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| d.exit_pipeline_mode())
    }

    pub fn pipeline_status(&self) -> PipelineStatus {
        self.driver
            .as_ref()
            .map(|d| d.pipeline_status())
            .unwrap_or_default()
    }

    pub fn pipeline_sync(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| d.pipeline_sync())
    }

    /// Starts listening on a channel. Subscriptions do not survive
    /// reconnection; resubscribe when the state changes to `Connected`.
    pub fn subscribe_to_notification<F>(&self, channel: &str, receiver: Option<&Receiver>, cb: F)
    where
        F: FnMut(&Notification) + 'static,
    {
        if let Some(d) = &self.driver {
            d.subscribe_to_notification(self, channel, receiver, Box::new(cb));
        }
    }

    pub fn unsubscribe_from_notification(&self, channel: &str) {
        if let Some(d) = &self.driver {
            d.unsubscribe_from_notification(self, channel);
        }
    }

    pub fn subscribed_to_notifications(&self) -> Vec<String> {
        self.driver
            .as_ref()
            .map(|d| d.subscribed_to_notifications())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("valid", &self.is_valid())
            .field("state", &self.state())
            .finish()
    }
}

use crate::{Database, Error, QueryKind, QueryResult, Receiver, Result, Value};
use futures::Stream;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

// Awaitable adapters over the callback API. Each future owns an internal
// Receiver, so dropping the future before completion cancels the underlying
// operation and no user-visible code runs afterwards.

struct SingleSlot<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

pub(crate) struct Completer<T> {
    slot: Rc<RefCell<SingleSlot<T>>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Completer<T> {
    pub(crate) fn complete(&self, value: T) {
        let mut slot = self.slot.borrow_mut();
        if slot.value.is_none() {
            slot.value = Some(value);
            if let Some(waker) = slot.waker.take() {
                waker.wake();
            }
        }
    }
}

/// One-shot awaitable fed by a callback.
pub struct SingleShot<T> {
    slot: Rc<RefCell<SingleSlot<T>>>,
    _receiver: Option<Receiver>,
}

impl<T> SingleShot<T> {
    pub(crate) fn receiver(&self) -> Option<&Receiver> {
        self._receiver.as_ref()
    }

    pub(crate) fn new(receiver: Option<Receiver>) -> (Self, Completer<T>) {
        let slot = Rc::new(RefCell::new(SingleSlot {
            value: None,
            waker: None,
        }));
        (
            Self {
                slot: slot.clone(),
                _receiver: receiver,
            },
            Completer { slot },
        )
    }
}

impl<T> Future for SingleShot<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = self.slot.borrow_mut();
        match slot.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Resolves with the first result set of a submission.
pub type ExecFuture = SingleShot<Result<Rc<QueryResult>>>;
/// Resolves when the connection handshake finishes.
pub type ConnectFuture = SingleShot<Result<()>>;

pub(crate) fn result_to_output(result: Rc<QueryResult>) -> Result<Rc<QueryResult>> {
    if result.has_error() {
        Err(Error::Query(result.error_string().to_string()))
    } else {
        Ok(result)
    }
}

pub(crate) fn exec_future(db: &Database, query: QueryKind, params: Vec<Value>) -> ExecFuture {
    let (future, completer) = SingleShot::new(Some(Receiver::new()));
    db.exec_raw(
        query,
        params,
        future._receiver.as_ref(),
        Some(Box::new(move |result| {
            completer.complete(result_to_output(result));
        })),
    );
    future
}

pub(crate) fn connect_future(db: &Database) -> ConnectFuture {
    let (future, completer) = SingleShot::new(None);
    db.open(move |outcome| completer.complete(outcome));
    future
}

struct StreamSlot {
    items: VecDeque<Rc<QueryResult>>,
    done: bool,
    waker: Option<Waker>,
}

/// Multi-shot awaitable: yields every result set of one submission, ending
/// after the set flagged `last_result_set`. Dropping the stream cancels the
/// query and flushes anything still buffered.
pub struct ResultStream {
    slot: Rc<RefCell<StreamSlot>>,
    _receiver: Receiver,
}

impl Stream for ResultStream {
    type Item = Rc<QueryResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut slot = self.slot.borrow_mut();
        if let Some(item) = slot.items.pop_front() {
            return Poll::Ready(Some(item));
        }
        if slot.done {
            return Poll::Ready(None);
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

pub(crate) fn stream_future(db: &Database, query: QueryKind, params: Vec<Value>) -> ResultStream {
    let receiver = Receiver::new();
    let slot = Rc::new(RefCell::new(StreamSlot {
        items: VecDeque::new(),
        done: false,
        waker: None,
    }));
    let feeder = slot.clone();
    db.exec_raw(
        query,
        params,
        Some(&receiver),
        Some(Box::new(move |result| {
            let mut slot = feeder.borrow_mut();
            if slot.done {
                return;
            }
            slot.done = result.last_result_set();
            slot.items.push_back(result);
            if let Some(waker) = slot.waker.take() {
                waker.wake();
            }
        })),
    );
    ResultStream {
        slot,
        _receiver: receiver,
    }
}

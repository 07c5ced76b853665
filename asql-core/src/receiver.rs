use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Cancellation scope for callback-based operations.
///
/// Every enqueued query may be associated with a `Receiver`. When the
/// receiver is dropped before the result arrives the query is cancelled: a
/// queued query is removed on dequeue, a running one gets the backend's
/// out-of-band cancel, and in either case the user callback is never
/// invoked. Cancellation is best-effort; a completed query's callback can
/// still fire if the drop races with delivery.
#[derive(Default)]
pub struct Receiver {
    inner: Rc<ReceiverInner>,
}

#[derive(Default)]
struct ReceiverInner {
    hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weak watch handle stored by drivers beside the queued query.
    pub fn watch(&self) -> ReceiverWatch {
        ReceiverWatch {
            token: Some(Rc::downgrade(&self.inner)),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        for hook in self.inner.hooks.take() {
            hook();
        }
    }
}

/// Weak side of a [`Receiver`]. A watch created without a receiver never
/// reports cancellation.
#[derive(Clone, Default)]
pub struct ReceiverWatch {
    token: Option<Weak<ReceiverInner>>,
}

impl ReceiverWatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.token {
            Some(weak) => weak.strong_count() == 0,
            None => false,
        }
    }

    /// Registers a hook fired when the receiver is dropped. Drivers use this
    /// to send the out-of-band cancel for the query running on the wire. The
    /// hook is a no-op when the watch has no receiver or it is already gone.
    pub fn on_drop(&self, hook: impl FnOnce() + 'static) {
        if let Some(inner) = self.token.as_ref().and_then(Weak::upgrade) {
            inner.hooks.borrow_mut().push(Box::new(hook));
        }
    }
}

impl From<Option<&Receiver>> for ReceiverWatch {
    fn from(receiver: Option<&Receiver>) -> Self {
        receiver.map(Receiver::watch).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn watch_tracks_lifetime() {
        let receiver = Receiver::new();
        let watch = receiver.watch();
        assert!(!watch.is_cancelled());
        drop(receiver);
        assert!(watch.is_cancelled());
    }

    #[test]
    fn absent_receiver_never_cancels() {
        let watch = ReceiverWatch::from(None);
        assert!(!watch.is_cancelled());
    }

    #[test]
    fn hooks_fire_on_drop() {
        let fired = Rc::new(Cell::new(0));
        let receiver = Receiver::new();
        let watch = receiver.watch();
        for _ in 0..2 {
            let fired = fired.clone();
            watch.on_drop(move || fired.set(fired.get() + 1));
        }
        assert_eq!(fired.get(), 0);
        drop(receiver);
        assert_eq!(fired.get(), 2);
    }
}

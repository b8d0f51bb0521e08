//! One-shot asynchronous completion primitive.
//!
//! Every suspending operation of the engine — format enumeration, payload
//! fetch — hands the caller an [`AsyncRequest`]. The request starts pending
//! and completes exactly once, with either the value or the [`Error`] that
//! ended it. It can be polled, blocked on, or given a single completion
//! callback.
//!
//! Dropping a pending request unregisters it from its owner and best-effort
//! cancels the underlying native transfer; the callback is not invoked. A
//! late native answer arriving after cancellation is silently discarded by
//! the idempotent [`Completer`].
//!
//! Callbacks are delivered through a per-connection [`CallbackQueue`]: they
//! always run on the event-loop-driving thread, never from inside
//! `complete()` itself. A callback that issues new requests only observes
//! them completing in a later drain step.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use log::warn;

use crate::error::{ErrorKind, Result};

/// Deferred delivery queue for completion callbacks.
///
/// `drain` is guarded against re-entry: a callback completing further
/// requests pushes their callbacks onto the queue and returns; the outer
/// drain picks them up.
#[derive(Clone, Default)]
pub(crate) struct CallbackQueue {
    inner: Rc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    ready: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    draining: Cell<bool>,
}

impl CallbackQueue {
    pub(crate) fn push(&self, callback: impl FnOnce() + 'static) {
        self.inner.ready.borrow_mut().push_back(Box::new(callback));
    }

    pub(crate) fn drain(&self) {
        if self.inner.draining.get() {
            return;
        }

        self.inner.draining.set(true);
        loop {
            let next = self.inner.ready.borrow_mut().pop_front();
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
        self.inner.draining.set(false);
    }
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("queued", &self.inner.ready.borrow().len())
            .field("draining", &self.inner.draining.get())
            .finish()
    }
}

/// One blocking dispatch step of the transport, used by [`AsyncRequest::wait`].
pub(crate) type Pump = Rc<dyn Fn() -> Result<()>>;

enum State<T> {
    Pending {
        callback: Option<Box<dyn FnOnce(Result<T>)>>,
        canceler: Option<Box<dyn FnOnce()>>,
        pump: Option<Pump>,
    },
    /// `None` once the value was taken by `poll` or claimed by the callback.
    Completed(Option<Result<T>>),
}

struct Shared<T> {
    state: RefCell<State<T>>,
    queue: CallbackQueue,
}

/// A one-shot, cancelable request for an asynchronously produced value.
pub struct AsyncRequest<T> {
    shared: Rc<Shared<T>>,
}

/// The producing half of an [`AsyncRequest`].
///
/// Holds only a weak reference: completing a request whose consumer is gone
/// is a silent no-op, which is exactly the fate of a late native answer
/// arriving after cancellation.
pub(crate) struct Completer<T> {
    shared: Weak<Shared<T>>,
    queue: CallbackQueue,
}

impl<T: 'static> AsyncRequest<T> {
    pub(crate) fn new(queue: &CallbackQueue) -> (Self, Completer<T>) {
        let shared = Rc::new(Shared {
            state: RefCell::new(State::Pending {
                callback: None,
                canceler: None,
                pump: None,
            }),
            queue: queue.clone(),
        });
        let completer = Completer { shared: Rc::downgrade(&shared), queue: queue.clone() };
        (Self { shared }, completer)
    }

    /// A request that is already resolved.
    pub(crate) fn completed(queue: &CallbackQueue, result: Result<T>) -> Self {
        let (request, completer) = Self::new(queue);
        completer.complete(result);
        request
    }

    /// Install the cancellation hook run when a pending request is dropped.
    pub(crate) fn set_canceler(&self, hook: impl FnOnce() + 'static) {
        if let State::Pending { canceler, .. } = &mut *self.shared.state.borrow_mut() {
            *canceler = Some(Box::new(hook));
        }
    }

    /// Install the blocking pump used by [`wait`](Self::wait).
    pub(crate) fn set_pump(&self, pump: Pump) {
        if let State::Pending { pump: slot, .. } = &mut *self.shared.state.borrow_mut() {
            *slot = Some(pump);
        }
    }

    /// Whether the request has resolved.
    pub fn is_completed(&self) -> bool {
        matches!(*self.shared.state.borrow(), State::Completed(_))
    }

    /// Take the result if the request has resolved.
    ///
    /// The value is returned at most once; later polls of a resolved request
    /// yield `None`.
    pub fn poll(&self) -> Option<Result<T>> {
        match &mut *self.shared.state.borrow_mut() {
            State::Completed(value) => value.take(),
            State::Pending { .. } => None,
        }
    }

    /// Register the completion callback.
    ///
    /// At most one callback is accepted; a second registration is a local
    /// bug, logged and dropped. If the request already resolved, the callback
    /// is delivered through the queue rather than invoked in place.
    pub fn on_complete(&self, callback: impl FnOnce(Result<T>) + 'static) {
        let mut state = self.shared.state.borrow_mut();
        match &mut *state {
            State::Pending { callback: slot, .. } => {
                if slot.is_some() {
                    warn!("second completion callback registered on one request; dropped");
                } else {
                    *slot = Some(Box::new(callback));
                }
            },
            State::Completed(value) => match value.take() {
                Some(result) => {
                    drop(state);
                    self.shared.queue.push(move || callback(result));
                    self.shared.queue.drain();
                },
                None => warn!("completion callback registered after the result was claimed"),
            },
        }
    }

    /// Drive the transport until the request resolves, then take the result.
    ///
    /// Fails with [`ErrorKind::NotSupported`] when the creating transport
    /// installed no blocking pump, and with [`ErrorKind::BadState`] when the
    /// result was already claimed by a callback or an earlier poll.
    pub fn wait(self) -> Result<T> {
        loop {
            let pump = {
                let mut state = self.shared.state.borrow_mut();
                match &mut *state {
                    State::Completed(value) => {
                        return value.take().unwrap_or_else(|| Err(ErrorKind::BadState.into()));
                    },
                    State::Pending { pump, .. } => match pump {
                        Some(pump) => pump.clone(),
                        None => {
                            return Err(ErrorKind::NotSupported(
                                "blocking wait requires a transport pump",
                            )
                            .into());
                        },
                    },
                }
            };

            pump()?;
            self.shared.queue.drain();
        }
    }
}

impl<T> Drop for AsyncRequest<T> {
    fn drop(&mut self) {
        let canceler = match &mut *self.shared.state.borrow_mut() {
            State::Pending { canceler, .. } => canceler.take(),
            State::Completed(_) => None,
        };

        if let Some(canceler) = canceler {
            canceler();
        }
    }
}

impl<T> fmt::Debug for AsyncRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.borrow() {
            State::Pending { .. } => "pending",
            State::Completed(Some(_)) => "completed",
            State::Completed(None) => "claimed",
        };
        f.debug_struct("AsyncRequest").field("state", &state).finish()
    }
}

impl<T: 'static> Completer<T> {
    /// Resolve the request.
    ///
    /// Idempotent: the first completion wins, later ones (and completions of
    /// an already-dropped request) are silently discarded.
    pub(crate) fn complete(&self, result: Result<T>) {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        {
            let mut state = shared.state.borrow_mut();
            match &mut *state {
                State::Pending { callback, .. } => match callback.take() {
                    Some(callback) => {
                        *state = State::Completed(None);
                        drop(state);
                        self.queue.push(move || callback(result));
                    },
                    None => *state = State::Completed(Some(result)),
                },
                State::Completed(_) => return,
            }
        }

        self.queue.drain();
    }
}

impl<T> Completer<T> {
    /// Whether the consuming half still exists.
    pub(crate) fn is_live(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone(), queue: self.queue.clone() }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("live", &self.is_live()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn poll_takes_the_value_once() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);
        assert!(request.poll().is_none());

        completer.complete(Ok(7));
        assert_eq!(request.poll().unwrap().unwrap(), 7);
        assert!(request.poll().is_none());
    }

    #[test]
    fn double_complete_invokes_callback_exactly_once() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);

        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        request.on_complete(move |result| {
            assert_eq!(result.unwrap(), 1);
            seen.set(seen.get() + 1);
        });

        completer.complete(Ok(1));
        completer.complete(Ok(2));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn drop_while_pending_runs_canceler_not_callback() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);

        let canceled = Rc::new(Cell::new(false));
        let flag = canceled.clone();
        request.set_canceler(move || flag.set(true));
        request.on_complete(|_| panic!("callback must not run after cancellation"));

        drop(request);
        assert!(canceled.get());
        assert!(!completer.is_live());

        // The late native answer is discarded.
        completer.complete(Ok(3));
    }

    #[test]
    fn callback_registered_after_completion_still_fires() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);
        completer.complete(Ok(9));

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        request.on_complete(move |result| {
            assert_eq!(result.unwrap(), 9);
            flag.set(true);
        });
        assert!(fired.get());
    }

    #[test]
    fn completion_from_inside_a_callback_is_deferred() {
        let queue = CallbackQueue::default();
        let (outer, outer_completer) = AsyncRequest::<u32>::new(&queue);
        let (inner, inner_completer) = AsyncRequest::<u32>::new(&queue);

        let order = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        inner.on_complete(move |_| log.borrow_mut().push("inner"));

        let log = order.clone();
        outer.on_complete(move |_| {
            log.borrow_mut().push("outer-begin");
            // Completes a second request from inside a callback: its
            // callback must not run until this one returned.
            inner_completer.complete(Ok(2));
            log.borrow_mut().push("outer-end");
        });

        outer_completer.complete(Ok(1));
        assert_eq!(*order.borrow(), ["outer-begin", "outer-end", "inner"]);
    }

    #[test]
    fn wait_after_the_result_was_claimed_fails_with_bad_state() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);
        completer.complete(Ok(5));
        assert_eq!(request.poll().unwrap().unwrap(), 5);

        let err = request.wait().unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::BadState);
    }

    #[test]
    fn completer_debug_reports_liveness() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);
        assert_eq!(format!("{completer:?}"), "Completer { live: true }");

        drop(request);
        assert_eq!(format!("{completer:?}"), "Completer { live: false }");
    }

    #[test]
    fn wait_without_pump_fails_closed() {
        let queue = CallbackQueue::default();
        let (request, _completer) = AsyncRequest::<u32>::new(&queue);
        let err = request.wait().unwrap_err();
        assert!(err.not_supported());
    }

    #[test]
    fn wait_drives_the_pump_until_completion() {
        let queue = CallbackQueue::default();
        let (request, completer) = AsyncRequest::<u32>::new(&queue);

        let steps = Rc::new(Cell::new(0));
        let counter = steps.clone();
        request.set_pump(Rc::new(move || {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                completer.complete(Ok(42));
            }
            Ok(())
        }));

        assert_eq!(request.wait().unwrap(), 42);
        assert_eq!(steps.get(), 3);
    }
}

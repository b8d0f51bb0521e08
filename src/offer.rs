//! Receiver-side proxy for a remote data source.
//!
//! A [`DataOffer`] stands in for a source owned by another process. Its
//! format list is unknown until the peer answers, and every payload fetch is
//! an asynchronous native round trip. One shared record exists per remote
//! source; the handles the engine and the application hold are cheap clones
//! of it, and tearing the record down fails every pending request atomically.
//!
//! Request bookkeeping reaches back to the record only through [`Weak`]
//! references, so completion closures never keep an invalidated offer alive
//! and no strong cycle exists between a session and its offer.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::format::DataFormat;
use crate::request::{AsyncRequest, CallbackQueue, Completer};
use crate::selection::SelectionKind;
use crate::transport::{NativeName, Transport};

/// A handle to remote clipboard or drag content.
#[derive(Clone)]
pub struct DataOffer {
    shared: Rc<OfferShared>,
}

pub(crate) struct OfferShared {
    selection: SelectionKind,
    transport: Weak<dyn Transport>,
    queue: CallbackQueue,
    state: RefCell<OfferState>,
}

struct OfferState {
    alive: bool,
    /// Native name and translated identity per remote format, in the
    /// remote producer's preference order.
    formats: Option<Vec<(NativeName, DataFormat)>>,
    enumeration: Option<Enumeration>,
    pending: Vec<PendingFetch>,
    next_id: u64,
    /// The offer was delivered by a drop and owes the peer a finished
    /// acknowledgement.
    dropped: bool,
    finished: bool,
}

/// The single in-flight native format enumeration, shared by every request
/// that is waiting on the format list.
struct Enumeration {
    /// Keeps the native round trip alive; dropping it would cancel the
    /// enumeration under the waiters.
    _native: AsyncRequest<Vec<NativeName>>,
    waiters: Vec<(u64, Completer<Vec<DataFormat>>)>,
    /// Data requests issued before the formats were known; each is resolved
    /// into a fetch once the list arrives, and each is cancelable without
    /// touching the shared enumeration.
    continuations: Vec<(u64, DataFormat, Completer<Vec<u8>>)>,
}

struct PendingFetch {
    id: u64,
    completer: Completer<Vec<u8>>,
    /// Keeps the native fetch alive; dropped on cancellation, which releases
    /// the native resources exactly once.
    _native: AsyncRequest<Vec<u8>>,
}

impl DataOffer {
    pub(crate) fn new(
        selection: SelectionKind,
        transport: &Rc<dyn Transport>,
        queue: &CallbackQueue,
        inline_formats: Option<Vec<NativeName>>,
    ) -> Self {
        let formats = inline_formats.map(|names| {
            names.into_iter().map(|name| (name.clone(), transport.to_format(&name))).collect()
        });

        Self {
            shared: Rc::new(OfferShared {
                selection,
                transport: Rc::downgrade(transport),
                queue: queue.clone(),
                state: RefCell::new(OfferState {
                    alive: true,
                    formats,
                    enumeration: None,
                    pending: Vec::new(),
                    next_id: 0,
                    dropped: false,
                    finished: false,
                }),
            }),
        }
    }

    /// The remote format list.
    ///
    /// The first call triggers a native enumeration; concurrent callers
    /// share that single round trip. Once the list is known it is cached and
    /// later calls resolve synchronously.
    pub fn formats(&self) -> AsyncRequest<Vec<DataFormat>> {
        let (request, completer) = AsyncRequest::new(&self.shared.queue);
        self.shared.install_pump(&request);

        let transport = match self.shared.transport.upgrade() {
            Some(transport) => transport,
            None => {
                completer.complete(Err(ErrorKind::OwnershipLost.into()));
                return request;
            },
        };

        let id;
        {
            let mut state = self.shared.state.borrow_mut();
            if !state.alive {
                drop(state);
                completer.complete(Err(ErrorKind::OwnershipLost.into()));
                return request;
            }

            if let Some(formats) = &state.formats {
                let list = translated(formats);
                drop(state);
                completer.complete(Ok(list));
                return request;
            }

            id = state.bump_id();
            if let Some(enumeration) = &mut state.enumeration {
                enumeration.waiters.push((id, completer));
                drop(state);
                self.shared.set_cancel_hook(&request, id);
                return request;
            }
        }

        // No enumeration in flight; start one. The native request may
        // resolve synchronously, in which case the formats are cached by the
        // time we re-borrow below.
        let native = OfferShared::start_enumeration(&self.shared, &transport);

        let mut state = self.shared.state.borrow_mut();
        if let Some(formats) = &state.formats {
            let list = translated(formats);
            drop(state);
            completer.complete(Ok(list));
            return request;
        }
        state.enumeration = Some(Enumeration {
            _native: native,
            waiters: vec![(id, completer)],
            continuations: Vec::new(),
        });
        drop(state);

        self.shared.set_cancel_hook(&request, id);
        request
    }

    /// Fetch the payload for `format`.
    ///
    /// If the format list is not yet known the request chains behind the
    /// shared enumeration; canceling the chained request leaves the
    /// enumeration untouched for other waiters. Resolution picks the
    /// remote's best matching representation: the first format in the
    /// remote's preference order that matches the requested one.
    pub fn data(&self, format: &DataFormat) -> AsyncRequest<Vec<u8>> {
        let (request, completer) = AsyncRequest::new(&self.shared.queue);
        self.shared.install_pump(&request);

        let transport = match self.shared.transport.upgrade() {
            Some(transport) => transport,
            None => {
                completer.complete(Err(ErrorKind::OwnershipLost.into()));
                return request;
            },
        };

        let id;
        {
            let mut state = self.shared.state.borrow_mut();
            if !state.alive {
                drop(state);
                completer.complete(Err(ErrorKind::OwnershipLost.into()));
                return request;
            }

            id = state.bump_id();

            if state.formats.is_some() {
                drop(state);
                OfferShared::issue_fetch(&self.shared, &transport, id, format, completer);
                self.shared.set_cancel_hook(&request, id);
                return request;
            }

            if let Some(enumeration) = &mut state.enumeration {
                enumeration.continuations.push((id, format.clone(), completer));
                drop(state);
                self.shared.set_cancel_hook(&request, id);
                return request;
            }
        }

        let native = OfferShared::start_enumeration(&self.shared, &transport);

        let mut state = self.shared.state.borrow_mut();
        if state.formats.is_some() {
            drop(state);
            OfferShared::issue_fetch(&self.shared, &transport, id, format, completer);
        } else {
            state.enumeration = Some(Enumeration {
                _native: native,
                waiters: Vec::new(),
                continuations: vec![(id, format.clone(), completer)],
            });
            drop(state);
        }

        self.shared.set_cancel_hook(&request, id);
        request
    }

    /// The format list, when already known.
    pub fn cached_formats(&self) -> Option<Vec<DataFormat>> {
        self.shared.state.borrow().formats.as_ref().map(|formats| translated(formats))
    }

    /// Signal that the application has consumed a dropped payload.
    ///
    /// Transports that require an explicit handshake acknowledgement send it
    /// here, and only here: never before the application is done with the
    /// data. Idempotent; a no-op for offers that did not come from a drop.
    pub fn finish(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            if !state.dropped || state.finished {
                return;
            }
            state.finished = true;
        }

        if let Some(transport) = self.shared.transport.upgrade() {
            transport.send_finished(true);
        }
    }

    pub(crate) fn mark_dropped(&self) {
        self.shared.state.borrow_mut().dropped = true;
    }

    /// End the session this offer belongs to: every pending request fails
    /// atomically and later calls resolve to [`ErrorKind::OwnershipLost`].
    pub(crate) fn invalidate(&self) {
        self.shared.teardown();
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.shared.state.borrow().alive
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &DataOffer) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for DataOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("DataOffer")
            .field("selection", &self.shared.selection)
            .field("alive", &state.alive)
            .field("formats_known", &state.formats.is_some())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl OfferState {
    fn bump_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl OfferShared {
    fn install_pump(&self, request: &AsyncRequest<impl Sized + 'static>) {
        let transport = self.transport.clone();
        request.set_pump(Rc::new(move || match transport.upgrade() {
            Some(transport) => transport.pump(),
            None => Err(ErrorKind::TransportFailure.into()),
        }));
    }

    fn set_cancel_hook(self: &Rc<Self>, request: &AsyncRequest<impl Sized + 'static>, id: u64) {
        let weak = Rc::downgrade(self);
        request.set_canceler(move || {
            if let Some(shared) = weak.upgrade() {
                shared.cancel_request(id);
            }
        });
    }

    /// Kick off the shared native enumeration. Must be called without the
    /// state borrowed: an inline-announcing transport resolves the request
    /// synchronously, which re-enters `finish_enumeration`.
    fn start_enumeration(
        self: &Rc<Self>,
        transport: &Rc<dyn Transport>,
    ) -> AsyncRequest<Vec<NativeName>> {
        let native = transport.enumerate_formats(self.selection);
        let weak = Rc::downgrade(self);
        native.on_complete(move |result| {
            if let Some(shared) = weak.upgrade() {
                shared.finish_enumeration(result);
            }
        });
        native
    }

    fn finish_enumeration(self: &Rc<Self>, result: Result<Vec<NativeName>>) {
        let transport = self.transport.upgrade();

        let (waiters, continuations) = {
            let mut state = self.state.borrow_mut();
            match state.enumeration.take() {
                Some(enumeration) => (enumeration.waiters, enumeration.continuations),
                None => (Vec::new(), Vec::new()),
            }
        };

        let result = result.and_then(|names| match &transport {
            Some(transport) => Ok(names
                .into_iter()
                .map(|name| {
                    let format = transport.to_format(&name);
                    (name, format)
                })
                .collect::<Vec<_>>()),
            None => Err(ErrorKind::OwnershipLost.into()),
        });

        match result {
            Ok(pairs) => {
                let list = translated(&pairs);
                {
                    let mut state = self.state.borrow_mut();
                    if !state.alive {
                        // Torn down while the answer was in flight; the
                        // waiters were already failed.
                        return;
                    }
                    state.formats = Some(pairs);
                }

                debug!("remote offer advertises {} format(s)", list.len());
                for (_, completer) in waiters {
                    completer.complete(Ok(list.clone()));
                }

                let transport = transport.expect("translated formats without a transport");
                for (id, format, completer) in continuations {
                    Self::issue_fetch(self, &transport, id, &format, completer);
                }
            },
            Err(err) => {
                for (_, completer) in waiters {
                    completer.complete(Err(err.clone()));
                }
                for (_, _, completer) in continuations {
                    completer.complete(Err(err.clone()));
                }
            },
        }
    }

    /// Issue the native fetch for one data request. Must be called without
    /// the state borrowed.
    fn issue_fetch(
        self: &Rc<Self>,
        transport: &Rc<dyn Transport>,
        id: u64,
        format: &DataFormat,
        completer: Completer<Vec<u8>>,
    ) {
        let native_name = {
            let state = self.state.borrow();
            if !state.alive {
                None
            } else {
                state
                    .formats
                    .as_ref()
                    .expect("fetch issued before formats were known")
                    .iter()
                    .find(|(_, remote)| remote.matches(format))
                    .map(|(name, _)| name.clone())
            }
        };

        let name = match native_name {
            Some(name) => name,
            None => {
                if self.state.borrow().alive {
                    warn!("requested format {format:?} is not offered by the remote source");
                    completer.complete(Err(ErrorKind::UnsupportedFormat.into()));
                } else {
                    completer.complete(Err(ErrorKind::OwnershipLost.into()));
                }
                return;
            },
        };

        let native = transport.fetch_data(self.selection, &name);
        let weak = Rc::downgrade(self);
        let forward = completer.clone();
        native.on_complete(move |result| {
            if let Some(shared) = weak.upgrade() {
                shared.remove_pending(id);
            }
            forward.complete(result);
        });

        if !native.is_completed() {
            self.state.borrow_mut().pending.push(PendingFetch { id, completer, _native: native });
        }
    }

    fn remove_pending(&self, id: u64) {
        let mut state = self.state.borrow_mut();
        state.pending.retain(|fetch| fetch.id != id);
    }

    /// Unregister a canceled request. The shared enumeration survives even
    /// when its last chained consumer goes away; other offers-in-waiting may
    /// join it later and the cached list is useful regardless.
    fn cancel_request(&self, id: u64) {
        let mut state = self.state.borrow_mut();
        if let Some(enumeration) = &mut state.enumeration {
            enumeration.waiters.retain(|(waiter, _)| *waiter != id);
            enumeration.continuations.retain(|(waiter, _, _)| *waiter != id);
        }
        state.pending.retain(|fetch| fetch.id != id);
    }

    fn teardown(&self) {
        let (waiters, continuations, pending, owes_ack) = {
            let mut state = self.state.borrow_mut();
            if !state.alive {
                return;
            }
            state.alive = false;

            let (waiters, continuations) = match state.enumeration.take() {
                Some(enumeration) => (enumeration.waiters, enumeration.continuations),
                None => (Vec::new(), Vec::new()),
            };
            let pending = std::mem::take(&mut state.pending);

            let owes_ack = state.dropped && !state.finished;
            state.finished = true;

            (waiters, continuations, pending, owes_ack)
        };

        let lost = || -> Error { ErrorKind::OwnershipLost.into() };
        for (_, completer) in waiters {
            completer.complete(Err(lost()));
        }
        for (_, _, completer) in continuations {
            completer.complete(Err(lost()));
        }
        for fetch in pending {
            fetch.completer.complete(Err(lost()));
        }

        // A dropped-but-never-finished offer still acknowledges the peer so
        // its session cannot hang.
        if owes_ack {
            if let Some(transport) = self.transport.upgrade() {
                transport.send_finished(false);
            }
        }
    }
}

impl Drop for OfferShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn translated(formats: &[(NativeName, DataFormat)]) -> Vec<DataFormat> {
    formats.iter().map(|(_, format)| format.clone()).collect()
}

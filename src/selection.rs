//! Selection ownership and remote-offer caching.
//!
//! A selection is a platform-defined exclusive ownership slot holding at
//! most one [`DataSource`] at a time. The manager tracks, per slot, the
//! locally installed source and a cached [`DataOffer`] for remotely owned
//! content, invalidated whenever the platform reports a different owner.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};

use crate::offer::DataOffer;
use crate::request::CallbackQueue;
use crate::source::DataSource;
use crate::transport::{NativeName, OwnerToken, Transport};

/// A platform-defined exclusive ownership slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    /// The regular clipboard.
    Clipboard,
    /// The primary selection, on platforms that define one.
    Primary,
    /// The drag payload of the active gesture. Managed by the engine; not a
    /// slot applications install into directly.
    Drag,
}

impl SelectionKind {
    pub(crate) const ALL: [SelectionKind; 3] =
        [SelectionKind::Clipboard, SelectionKind::Primary, SelectionKind::Drag];

    fn index(self) -> usize {
        match self {
            SelectionKind::Clipboard => 0,
            SelectionKind::Primary => 1,
            SelectionKind::Drag => 2,
        }
    }
}

#[derive(Default)]
struct Slot {
    local: Option<Rc<dyn DataSource>>,
    remote: Option<DataOffer>,
    owner: Option<OwnerToken>,
}

pub(crate) struct SelectionManager {
    transport: Rc<dyn Transport>,
    queue: CallbackQueue,
    slots: RefCell<[Slot; 3]>,
}

impl SelectionManager {
    pub(crate) fn new(transport: Rc<dyn Transport>, queue: CallbackQueue) -> Self {
        Self { transport, queue, slots: RefCell::new(Default::default()) }
    }

    /// Attempt to become the owner of `kind` with `source` as content.
    ///
    /// Returns `false` without side effects when the platform did not
    /// confirm exclusive ownership.
    pub(crate) fn acquire(&self, kind: SelectionKind, source: Rc<dyn DataSource>) -> bool {
        if !self.transport.acquire_ownership(kind) {
            debug!("failed to acquire {kind:?} ownership");
            return false;
        }

        let stale = {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[kind.index()];
            slot.local = Some(source);
            slot.owner = None;
            slot.remote.take()
        };
        if let Some(offer) = stale {
            offer.invalidate();
        }

        debug!("acquired {kind:?} ownership");
        true
    }

    /// Explicitly drop the locally owned content of `kind`.
    pub(crate) fn clear(&self, kind: SelectionKind) {
        let had_local = self.slots.borrow_mut()[kind.index()].local.take().is_some();
        if had_local {
            self.transport.release_ownership(kind);
            debug!("released {kind:?} ownership");
        }
    }

    /// The live offer for remotely owned content of `kind`.
    ///
    /// Recreates the offer when the platform-reported owner changed since
    /// the previous call; returns `None` when there is no owner.
    pub(crate) fn current(&self, kind: SelectionKind) -> Option<DataOffer> {
        let owner = self.transport.selection_owner(kind);

        let (stale, offer) = {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[kind.index()];

            match owner {
                None => {
                    slot.owner = None;
                    (slot.remote.take(), None)
                },
                Some(token) => {
                    let stale = if slot.owner != Some(token) || slot.remote.is_none() {
                        let stale = slot.remote.take();
                        slot.owner = Some(token);
                        slot.remote =
                            Some(DataOffer::new(kind, &self.transport, &self.queue, None));
                        stale
                    } else {
                        None
                    };
                    (stale, slot.remote.clone())
                },
            }
        };

        if let Some(stale) = stale {
            stale.invalidate();
        }
        offer
    }

    /// The platform revoked our ownership. Idempotent and silent, per
    /// platform convention; resources are released without the application
    /// being polled.
    pub(crate) fn ownership_lost(&self, kind: SelectionKind) {
        let had_local = self.slots.borrow_mut()[kind.index()].local.take().is_some();
        if had_local {
            debug!("lost {kind:?} ownership to another client");
        }
    }

    /// A new or no owner was reported for `kind`; the cached remote offer is
    /// stale and its pending requests fail now.
    pub(crate) fn invalidate_remote(&self, kind: SelectionKind) {
        let stale = {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[kind.index()];
            slot.owner = None;
            slot.remote.take()
        };
        if let Some(offer) = stale {
            offer.invalidate();
        }
    }

    /// The locally installed source of `kind`, if any.
    pub(crate) fn local_source(&self, kind: SelectionKind) -> Option<Rc<dyn DataSource>> {
        self.slots.borrow()[kind.index()].local.clone()
    }

    /// Answer a peer's format enumeration against the local source.
    pub(crate) fn serve_formats(&self, kind: SelectionKind) -> Vec<NativeName> {
        let source = match self.local_source(kind) {
            Some(source) => source,
            None => return Vec::new(),
        };

        source
            .formats()
            .iter()
            .filter_map(|format| self.transport.from_format(format))
            .collect()
    }

    /// Answer a peer's data request against the local source.
    ///
    /// The requested native name is translated and then resolved against the
    /// producer's preference order, so a kind-level match returns the
    /// producer's best representation rather than the first bit-compatible
    /// one.
    pub(crate) fn serve_data(&self, kind: SelectionKind, native: &str) -> Option<Vec<u8>> {
        let source = self.local_source(kind)?;
        let requested = self.transport.to_format(native);

        let advertised = source.formats().into_iter().find(|format| format.matches(&requested));
        let format = match advertised {
            Some(format) => format,
            None => {
                warn!("peer requested unadvertised format {native:?} from {kind:?}");
                return None;
            },
        };

        match source.data(&format) {
            Ok(payload) => Some(payload),
            Err(err) => {
                // A source refusing its own advertised format is a local
                // protocol bug; the peer's request fails, nothing else does.
                warn!("source failed to produce {format:?}: {err}");
                None
            },
        }
    }

    /// Fail everything and drop every source; used when the connection goes
    /// away.
    #[allow(dead_code)]
    pub(crate) fn teardown(&self) {
        for kind in SelectionKind::ALL {
            self.invalidate_remote(kind);
            self.ownership_lost(kind);
        }
    }
}

impl fmt::Debug for SelectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.borrow();
        f.debug_struct("SelectionManager")
            .field("local", &slots.iter().map(|slot| slot.local.is_some()).collect::<Vec<_>>())
            .field("remote", &slots.iter().map(|slot| slot.remote.is_some()).collect::<Vec<_>>())
            .finish()
    }
}

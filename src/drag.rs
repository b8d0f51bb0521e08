//! The drag-and-drop handshake state machine.
//!
//! One [`DragCoordinator`] lives per connection and runs both sides of the
//! protocol: the source side while this process drags, the target side while
//! a drag hovers one of our windows. Only one side is active per gesture; a
//! same-process drag degrades to the normal target protocol, with both sides
//! active for *different* halves of the same exchange.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::error::{ErrorKind, Result};
use crate::format::DataFormat;
use crate::offer::DataOffer;
use crate::request::CallbackQueue;
use crate::selection::{SelectionKind, SelectionManager};
use crate::source::DataSource;
use crate::transport::{NativeName, Position, Transport, WindowId};

bitflags! {
    /// The effect a drop will have, negotiated between source and target.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DndAction: u32 {
        const COPY = 1 << 0;
        const MOVE = 1 << 1;
        const LINK = 1 << 2;
        const ASK  = 1 << 3;
    }
}

impl Default for DndAction {
    fn default() -> Self {
        DndAction::COPY
    }
}

/// Per-window listener for incoming drags, registered through the device.
///
/// The windowing layer implements this next to its other window callbacks.
pub trait DndListener {
    /// A drag entered the window.
    fn dnd_enter(&self, offer: &DataOffer, position: Position);

    /// The drag moved. Return the accepted format, or `None` to reject the
    /// drop at this position. The answer is relayed to the source; the most
    /// recent one wins.
    fn dnd_move(&self, offer: &DataOffer, position: Position) -> Option<DataFormat>;

    /// The drag left without dropping. Pending requests against the offer
    /// fail once this returns.
    fn dnd_leave(&self, offer: &DataOffer);

    /// The payload was dropped. Ownership of the offer transfers to the
    /// listener; call [`DataOffer::finish`] once the data is consumed.
    fn dnd_drop(&self, offer: DataOffer, position: Position);
}

impl fmt::Debug for dyn DndListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DndListener").finish_non_exhaustive()
    }
}

/// Source-side session states.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    #[default]
    Idle,
    /// Ownership and grab acquired, no motion seen yet.
    Armed,
    Dragging,
    /// Drop sent; waiting for the peer's finished acknowledgement.
    Finished,
}

/// The latest status answer from the hovered target. Drives only the drag
/// cursor; it does not gate the drop.
#[derive(Debug, Clone, Default)]
pub struct StatusFeedback {
    pub accepted: bool,
    pub format: Option<DataFormat>,
    pub action: DndAction,
}

#[derive(Default)]
struct SourceSide {
    state: SourceState,
    source: Option<Rc<dyn DataSource>>,
    origin: Option<WindowId>,
    target: Option<WindowId>,
    native_formats: Vec<NativeName>,
    feedback: Option<StatusFeedback>,
    last_position: Position,
}

/// Target-side session states.
enum TargetSide {
    Idle,
    Entered {
        window: WindowId,
        offer: DataOffer,
        accepted: Option<DataFormat>,
        position: Position,
        /// Position updates seen; a drop without any answered update is a
        /// peer protocol violation.
        answered: bool,
    },
}

pub(crate) struct DragCoordinator {
    transport: Rc<dyn Transport>,
    queue: CallbackQueue,
    listeners: RefCell<HashMap<WindowId, Rc<dyn DndListener>>>,
    source: RefCell<SourceSide>,
    target: RefCell<TargetSide>,
}

impl DragCoordinator {
    pub(crate) fn new(transport: Rc<dyn Transport>, queue: CallbackQueue) -> Self {
        Self {
            transport,
            queue,
            listeners: RefCell::new(HashMap::new()),
            source: RefCell::new(SourceSide::default()),
            target: RefCell::new(TargetSide::Idle),
        }
    }

    pub(crate) fn register_listener(&self, window: WindowId, listener: Rc<dyn DndListener>) {
        self.listeners.borrow_mut().insert(window, listener);
    }

    pub(crate) fn unregister_listener(&self, window: WindowId) {
        self.listeners.borrow_mut().remove(&window);
    }

    fn listener(&self, window: WindowId) -> Option<Rc<dyn DndListener>> {
        self.listeners.borrow().get(&window).cloned()
    }

    // Source side.

    /// Begin a drag gesture: acquire the drag selection, capture the
    /// pointer, arm the session.
    pub(crate) fn start(
        &self,
        selections: &SelectionManager,
        source: Rc<dyn DataSource>,
        origin: WindowId,
    ) -> Result<()> {
        {
            let side = self.source.borrow();
            if side.state != SourceState::Idle {
                return Err(ErrorKind::BadState.into());
            }
        }

        if !selections.acquire(SelectionKind::Drag, source.clone()) {
            return Err(ErrorKind::OwnershipLost.into());
        }

        if let Err(err) = self.transport.grab_pointer(origin) {
            selections.clear(SelectionKind::Drag);
            return Err(err);
        }

        let native_formats: Vec<NativeName> =
            source.formats().iter().filter_map(|format| self.transport.from_format(format)).collect();

        let mut side = self.source.borrow_mut();
        *side = SourceSide {
            state: SourceState::Armed,
            source: Some(source),
            origin: Some(origin),
            target: None,
            native_formats,
            feedback: None,
            last_position: Position::default(),
        };

        debug!("drag armed from {origin:?}");
        Ok(())
    }

    /// Pointer motion while this process is the drag source.
    ///
    /// `target` is the window under the pointer per the platform's hit-test.
    /// A target change sends leave to the old window and enter to the new
    /// one; every update sends a position message.
    pub(crate) fn source_motion(&self, target: Option<WindowId>, position: Position) {
        let mut side = self.source.borrow_mut();
        match side.state {
            SourceState::Armed => side.state = SourceState::Dragging,
            SourceState::Dragging => {},
            _ => return,
        }

        side.last_position = position;

        if side.target != target {
            if let Some(old) = side.target {
                self.transport.send_leave(old);
            }
            if let Some(new) = target {
                self.transport.send_enter(new, &side.native_formats, position);
            }
            side.target = target;
            // A status answered for the previous target is stale.
            side.feedback = None;
        }

        if let Some(current) = side.target {
            self.transport.send_position(current, position, DndAction::COPY | DndAction::MOVE);
        }
    }

    /// A status reply from the hovered target. Most recent answer wins;
    /// answers for an already-left target are discarded.
    pub(crate) fn status(&self, accepted: bool, format: Option<NativeName>, action: DndAction) {
        let mut side = self.source.borrow_mut();
        if side.state != SourceState::Dragging || side.target.is_none() {
            trace!("discarding stale drag status");
            return;
        }

        let format = format.map(|name| self.transport.to_format(&name));
        side.feedback = Some(StatusFeedback { accepted, format, action });
    }

    /// The feedback driving the drag cursor, if the target answered yet.
    pub(crate) fn feedback(&self) -> Option<StatusFeedback> {
        self.source.borrow().feedback.clone()
    }

    /// The pointer button was released: drop on the current target, or
    /// finish immediately when there is none.
    pub(crate) fn source_released(&self, selections: &SelectionManager, position: Position) {
        let dropped_on = {
            let mut side = self.source.borrow_mut();
            match side.state {
                SourceState::Armed | SourceState::Dragging => {},
                _ => return,
            }
            side.last_position = position;

            match side.target {
                Some(target) => {
                    side.state = SourceState::Finished;
                    Some(target)
                },
                None => None,
            }
        };

        match dropped_on {
            Some(target) => {
                debug!("drop sent to {target:?}");
                self.transport.send_drop(target);
                // The transport now serves the target's fetches against the
                // installed source; the session finishes when the peer (or
                // the platform's timeout) says so.
            },
            None => self.finish_source(selections),
        }
    }

    /// The peer acknowledged the drop, or the platform gave up waiting.
    pub(crate) fn finished(&self, selections: &SelectionManager) {
        self.finish_source(selections);
    }

    /// Tear the source session down: release the grab and the drag
    /// selection exactly once, then return to idle.
    fn finish_source(&self, selections: &SelectionManager) {
        {
            let mut side = self.source.borrow_mut();
            if side.state == SourceState::Idle {
                return;
            }
            *side = SourceSide::default();
        }

        self.transport.release_grab();
        selections.clear(SelectionKind::Drag);
        debug!("drag session finished");
    }

    // Target side.

    /// A drag entered one of our windows.
    pub(crate) fn entered(
        &self,
        window: WindowId,
        position: Position,
        formats: Option<Vec<NativeName>>,
    ) {
        {
            let target = self.target.borrow();
            if let TargetSide::Entered { .. } = &*target {
                warn!("drag enter while a drag is already entered; dropping the old session");
            }
        }
        self.leave_internal();

        let offer = DataOffer::new(SelectionKind::Drag, &self.transport, &self.queue, formats);

        *self.target.borrow_mut() = TargetSide::Entered {
            window,
            offer: offer.clone(),
            accepted: None,
            position,
            answered: false,
        };

        debug!("drag entered {window:?} at {position:?}");
        if let Some(listener) = self.listener(window) {
            listener.dnd_enter(&offer, position);
        }
    }

    /// The drag moved over the entered window. Asks the listener for its
    /// answer and relays accept/reject plus the chosen format to the source.
    pub(crate) fn moved(&self, position: Position) {
        let (window, offer) = {
            let mut target = self.target.borrow_mut();
            match &mut *target {
                TargetSide::Entered { window, offer, position: last, .. } => {
                    *last = position;
                    (*window, offer.clone())
                },
                TargetSide::Idle => {
                    trace!("drag motion without an entered window");
                    return;
                },
            }
        };

        let chosen = self.listener(window).and_then(|listener| listener.dnd_move(&offer, position));

        let native = chosen.as_ref().and_then(|format| self.transport.from_format(format));
        self.transport.send_status(native.as_deref(), DndAction::COPY);

        if let TargetSide::Entered { accepted, answered, .. } = &mut *self.target.borrow_mut() {
            *accepted = chosen;
            *answered = true;
        }
    }

    /// The drag left the entered window without dropping.
    pub(crate) fn left(&self) {
        self.leave_internal();
    }

    fn leave_internal(&self) {
        let previous = std::mem::replace(&mut *self.target.borrow_mut(), TargetSide::Idle);
        if let TargetSide::Entered { window, offer, .. } = previous {
            debug!("drag left {window:?}");
            if let Some(listener) = self.listener(window) {
                listener.dnd_leave(&offer);
            }
            offer.invalidate();
        }
    }

    /// The source released the payload over the entered window. Ownership
    /// of the offer transfers to the listener; the finished acknowledgement
    /// waits for [`DataOffer::finish`].
    pub(crate) fn dropped(&self, position: Position) {
        let previous = std::mem::replace(&mut *self.target.borrow_mut(), TargetSide::Idle);
        let (window, offer, answered) = match previous {
            TargetSide::Entered { window, offer, answered, .. } => (window, offer, answered),
            TargetSide::Idle => {
                warn!("drop without an entered window; ignoring");
                return;
            },
        };

        if !answered {
            // The source dropped before we ever answered a position update.
            warn!("drop before any answered position update; refusing it");
            self.transport.send_finished(false);
            offer.invalidate();
            return;
        }

        match self.listener(window) {
            Some(listener) => {
                debug!("drop delivered to {window:?} at {position:?}");
                offer.mark_dropped();
                listener.dnd_drop(offer, position);
            },
            None => {
                self.transport.send_finished(false);
                offer.invalidate();
            },
        }
    }

    /// Fail everything; used when the connection goes away.
    #[allow(dead_code)]
    pub(crate) fn teardown(&self, selections: &SelectionManager) {
        self.leave_internal();
        self.finish_source(selections);
    }
}

impl fmt::Debug for DragCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = self.source.borrow();
        let target = match &*self.target.borrow() {
            TargetSide::Idle => "idle",
            TargetSide::Entered { .. } => "entered",
        };
        f.debug_struct("DragCoordinator")
            .field("source_state", &source.state)
            .field("target_state", &target)
            .finish()
    }
}

//! In-process transport double used by the engine tests.
//!
//! Two [`LoopbackTransport`]s share a wire that simulates the asynchronous
//! half of a native protocol: every operation is queued and only takes
//! effect when the wire is pumped, the way a native round trip only resolves
//! on a later event-loop dispatch. The wire counts every native handle it
//! opens and closes, so leak assertions are exact.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::drag::DndAction;
use crate::error::{ErrorKind, Result};
use crate::format::DataFormat;
use crate::request::{AsyncRequest, CallbackQueue, Completer};
use crate::selection::SelectionKind;
use crate::transport::{
    NativeName, OwnerToken, Position, Transport, TransportHandler, WindowId,
};

fn other(side: usize) -> usize {
    1 - side
}

fn selection_index(kind: SelectionKind) -> usize {
    match kind {
        SelectionKind::Clipboard => 0,
        SelectionKind::Primary => 1,
        SelectionKind::Drag => 2,
    }
}

/// A simulated native handle: a pipe, a pending property read. Closed
/// exactly once, on completion or on cancellation.
#[derive(Clone)]
struct FetchGuard {
    wire: Weak<Wire>,
    done: Rc<Cell<bool>>,
}

impl FetchGuard {
    fn open(wire: &Rc<Wire>) -> Self {
        wire.open_handles.set(wire.open_handles.get() + 1);
        wire.total_opened.set(wire.total_opened.get() + 1);
        Self { wire: Rc::downgrade(wire), done: Rc::new(Cell::new(false)) }
    }

    /// Close the handle; returns whether this call was the one that did.
    fn release(&self) -> bool {
        if self.done.get() {
            return false;
        }
        self.done.set(true);
        if let Some(wire) = self.wire.upgrade() {
            wire.open_handles.set(wire.open_handles.get() - 1);
        }
        true
    }
}

enum Op {
    Enumerate {
        selection: SelectionKind,
        completer: Completer<Vec<NativeName>>,
        guard: FetchGuard,
    },
    Fetch {
        selection: SelectionKind,
        name: String,
        completer: Completer<Vec<u8>>,
        guard: FetchGuard,
    },
    OwnershipLost { to: usize, selection: SelectionKind },
    SelectionChanged { to: usize, selection: SelectionKind },
    DragEnter { to: usize, window: WindowId, names: Vec<NativeName>, position: Position },
    DragMotion { to: usize, position: Position },
    DragStatus { to: usize, accepted: Option<String>, action: DndAction },
    DragLeave { to: usize },
    DragDrop { to: usize, position: Position },
    DragFinished { to: usize },
}

struct Wire {
    ops: RefCell<VecDeque<Op>>,
    handlers: RefCell<[Option<Weak<dyn TransportHandler>>; 2]>,
    owners: RefCell<[Option<(usize, OwnerToken)>; 3]>,
    next_token: Cell<u64>,
    open_handles: Cell<i64>,
    total_opened: Cell<u64>,
    last_drag_position: Cell<Position>,
}

impl Wire {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            ops: RefCell::new(VecDeque::new()),
            handlers: RefCell::new([None, None]),
            owners: RefCell::new([None, None, None]),
            next_token: Cell::new(1),
            open_handles: Cell::new(0),
            total_opened: Cell::new(0),
            last_drag_position: Cell::new(Position::default()),
        })
    }

    fn handler(&self, side: usize) -> Option<Rc<dyn TransportHandler>> {
        self.handlers.borrow()[side].as_ref().and_then(Weak::upgrade)
    }

    fn owner_side(&self, selection: SelectionKind) -> Option<usize> {
        self.owners.borrow()[selection_index(selection)].map(|(side, _)| side)
    }

    fn push(&self, op: Op) {
        self.ops.borrow_mut().push_back(op);
    }

    /// Ownership changes preempt in-flight transfers, the way a native owner
    /// change invalidates outstanding conversions.
    fn push_front(&self, op: Op) {
        self.ops.borrow_mut().push_front(op);
    }

    /// Deliver one queued operation. Fails when the wire is idle so that a
    /// blocking wait on a request nothing will ever answer errors out
    /// instead of spinning.
    fn pump_one(&self) -> Result<()> {
        let op = match self.ops.borrow_mut().pop_front() {
            Some(op) => op,
            None => return Err(ErrorKind::TransportFailure.into()),
        };

        match op {
            Op::Enumerate { selection, completer, guard } => {
                if !guard.release() {
                    return Ok(()); // canceled before delivery
                }
                let answer = match self.owner_side(selection).and_then(|side| self.handler(side))
                {
                    Some(handler) => Ok(handler.serve_formats(selection)),
                    None => Err(ErrorKind::OwnershipLost.into()),
                };
                completer.complete(answer);
            },
            Op::Fetch { selection, name, completer, guard } => {
                if !guard.release() {
                    return Ok(());
                }
                let answer = match self.owner_side(selection).and_then(|side| self.handler(side))
                {
                    Some(handler) => handler
                        .serve_data(selection, &name)
                        .ok_or_else(|| ErrorKind::TransportFailure.into()),
                    None => Err(ErrorKind::OwnershipLost.into()),
                };
                completer.complete(answer);
            },
            Op::OwnershipLost { to, selection } => {
                if let Some(handler) = self.handler(to) {
                    handler.ownership_lost(selection);
                }
            },
            Op::SelectionChanged { to, selection } => {
                if let Some(handler) = self.handler(to) {
                    handler.selection_changed(selection);
                }
            },
            Op::DragEnter { to, window, names, position } => {
                if let Some(handler) = self.handler(to) {
                    handler.drag_entered(window, position, Some(names));
                }
            },
            Op::DragMotion { to, position } => {
                if let Some(handler) = self.handler(to) {
                    handler.drag_moved(position);
                }
            },
            Op::DragStatus { to, accepted, action } => {
                if let Some(handler) = self.handler(to) {
                    handler.drag_status(accepted.is_some(), accepted, action);
                }
            },
            Op::DragLeave { to } => {
                if let Some(handler) = self.handler(to) {
                    handler.drag_left();
                }
            },
            Op::DragDrop { to, position } => {
                if let Some(handler) = self.handler(to) {
                    handler.drag_dropped(position);
                }
            },
            Op::DragFinished { to } => {
                if let Some(handler) = self.handler(to) {
                    handler.drag_finished();
                }
            },
        }

        Ok(())
    }
}

pub(crate) struct LoopbackTransport {
    wire: Rc<Wire>,
    side: usize,
    queue: CallbackQueue,
    grab_releases: Cell<u32>,
}

/// Two transports joined back to back, as if they were two processes on one
/// display connection.
pub(crate) fn pair() -> (Rc<LoopbackTransport>, Rc<LoopbackTransport>) {
    let wire = Wire::new();
    let a = Rc::new(LoopbackTransport {
        wire: wire.clone(),
        side: 0,
        queue: CallbackQueue::default(),
        grab_releases: Cell::new(0),
    });
    let b = Rc::new(LoopbackTransport {
        wire,
        side: 1,
        queue: CallbackQueue::default(),
        grab_releases: Cell::new(0),
    });
    (a, b)
}

impl LoopbackTransport {
    /// Deliver everything currently queued, including operations queued by
    /// the deliveries themselves.
    pub(crate) fn pump_all(&self) {
        for _ in 0..1000 {
            if self.wire.ops.borrow().is_empty() {
                return;
            }
            self.wire.pump_one().expect("wire went idle mid-pump");
        }
        panic!("loopback wire did not settle");
    }

    pub(crate) fn open_handles(&self) -> i64 {
        self.wire.open_handles.get()
    }

    pub(crate) fn total_opened(&self) -> u64 {
        self.wire.total_opened.get()
    }

    pub(crate) fn queued_ops(&self) -> usize {
        self.wire.ops.borrow().len()
    }

    pub(crate) fn grab_releases(&self) -> u32 {
        self.grab_releases.get()
    }

    /// Simulated pointer hit-test result while this side drags.
    pub(crate) fn simulate_motion(&self, target: Option<WindowId>, position: Position) {
        if let Some(handler) = self.wire.handler(self.side) {
            handler.source_motion(target, position);
        }
    }

    /// Simulated pointer-button release while this side drags.
    pub(crate) fn simulate_release(&self, position: Position) {
        if let Some(handler) = self.wire.handler(self.side) {
            handler.source_released(position);
        }
    }
}

impl Transport for LoopbackTransport {
    fn bind(&self, handler: Weak<dyn TransportHandler>) {
        self.wire.handlers.borrow_mut()[self.side] = Some(handler);
    }

    fn pump(&self) -> Result<()> {
        self.wire.pump_one()
    }

    fn enumerate_formats(&self, selection: SelectionKind) -> AsyncRequest<Vec<NativeName>> {
        let (request, completer) = AsyncRequest::new(&self.queue);
        let guard = FetchGuard::open(&self.wire);
        self.wire.push(Op::Enumerate { selection, completer, guard: guard.clone() });

        request.set_canceler(move || {
            guard.release();
        });
        let wire = Rc::downgrade(&self.wire);
        request.set_pump(Rc::new(move || match wire.upgrade() {
            Some(wire) => wire.pump_one(),
            None => Err(ErrorKind::TransportFailure.into()),
        }));
        request
    }

    fn fetch_data(&self, selection: SelectionKind, name: &str) -> AsyncRequest<Vec<u8>> {
        let (request, completer) = AsyncRequest::new(&self.queue);
        let guard = FetchGuard::open(&self.wire);
        self.wire.push(Op::Fetch {
            selection,
            name: name.to_owned(),
            completer,
            guard: guard.clone(),
        });

        request.set_canceler(move || {
            guard.release();
        });
        let wire = Rc::downgrade(&self.wire);
        request.set_pump(Rc::new(move || match wire.upgrade() {
            Some(wire) => wire.pump_one(),
            None => Err(ErrorKind::TransportFailure.into()),
        }));
        request
    }

    fn acquire_ownership(&self, selection: SelectionKind) -> bool {
        let previous = {
            let mut owners = self.wire.owners.borrow_mut();
            let token = OwnerToken(self.wire.next_token.get());
            self.wire.next_token.set(self.wire.next_token.get() + 1);
            std::mem::replace(
                &mut owners[selection_index(selection)],
                Some((self.side, token)),
            )
        };

        self.wire.push_front(Op::SelectionChanged { to: other(self.side), selection });
        if let Some((loser, _)) = previous {
            if loser != self.side {
                self.wire.push_front(Op::OwnershipLost { to: loser, selection });
            }
        }
        true
    }

    fn release_ownership(&self, selection: SelectionKind) {
        let mut owners = self.wire.owners.borrow_mut();
        let slot = &mut owners[selection_index(selection)];
        if matches!(slot, Some((side, _)) if *side == self.side) {
            *slot = None;
            drop(owners);
            self.wire.push_front(Op::SelectionChanged { to: other(self.side), selection });
        }
    }

    fn selection_owner(&self, selection: SelectionKind) -> Option<OwnerToken> {
        self.wire.owners.borrow()[selection_index(selection)].map(|(_, token)| token)
    }

    fn to_format(&self, native: &str) -> DataFormat {
        match native {
            "text/plain;charset=utf-8" => DataFormat::text(),
            "text/uri-list" => DataFormat::uri_list(),
            "image/png" => DataFormat::image(),
            "application/octet-stream" => DataFormat::raw(),
            other => DataFormat::new(other.to_owned()),
        }
    }

    fn from_format(&self, format: &DataFormat) -> Option<NativeName> {
        Some(format.name().to_owned())
    }

    fn grab_pointer(&self, _origin: WindowId) -> Result<()> {
        Ok(())
    }

    fn release_grab(&self) {
        self.grab_releases.set(self.grab_releases.get() + 1);
    }

    fn send_enter(&self, target: WindowId, formats: &[NativeName], position: Position) {
        self.wire.last_drag_position.set(position);
        self.wire.push(Op::DragEnter {
            to: other(self.side),
            window: target,
            names: formats.to_vec(),
            position,
        });
    }

    fn send_position(&self, _target: WindowId, position: Position, _actions: DndAction) {
        self.wire.last_drag_position.set(position);
        self.wire.push(Op::DragMotion { to: other(self.side), position });
    }

    fn send_status(&self, accepted: Option<&str>, action: DndAction) {
        self.wire.push(Op::DragStatus {
            to: other(self.side),
            accepted: accepted.map(str::to_owned),
            action,
        });
    }

    fn send_leave(&self, _target: WindowId) {
        self.wire.push(Op::DragLeave { to: other(self.side) });
    }

    fn send_drop(&self, _target: WindowId) {
        self.wire.push(Op::DragDrop {
            to: other(self.side),
            position: self.wire.last_drag_position.get(),
        });
    }

    fn send_finished(&self, _accepted: bool) {
        self.wire.push(Op::DragFinished { to: other(self.side) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DataDevice;
    use crate::drag::DndListener;
    use crate::format::DataFormat;
    use crate::offer::DataOffer;
    use crate::source::{DataSource, StaticSource};

    fn text_source(text: &str) -> Rc<dyn DataSource> {
        Rc::new(StaticSource::text(text))
    }

    #[test]
    fn clipboard_round_trip() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("hello")));
        ta.pump_all();

        let offer = dev_b.selection_offer(SelectionKind::Clipboard).expect("owner exists");
        let request = offer.data(&DataFormat::text());
        tb.pump_all();

        assert_eq!(request.poll().unwrap().unwrap(), b"hello");
        assert_eq!(tb.open_handles(), 0);
        assert!(tb.total_opened() >= 2, "enumeration and fetch each open a handle");
    }

    #[test]
    fn clipboard_fetch_can_block() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("blocking")));
        ta.pump_all();

        let offer = dev_b.selection_offer(SelectionKind::Clipboard).unwrap();
        let payload = offer.data(&DataFormat::text()).wait().unwrap();
        assert_eq!(payload, b"blocking");
    }

    #[test]
    fn formats_are_cached_after_first_enumeration() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("x")));
        ta.pump_all();

        let offer = dev_b.selection_offer(SelectionKind::Clipboard).unwrap();
        let first = offer.formats();
        tb.pump_all();
        assert!(first.poll().unwrap().is_ok());

        let opened = tb.total_opened();
        let second = offer.formats();
        // Resolved synchronously from the cache: no pumping, no new handle.
        assert!(second.poll().unwrap().is_ok());
        assert_eq!(tb.total_opened(), opened);
    }

    #[test]
    fn unsupported_format_fails_only_that_request() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("hello")));
        ta.pump_all();

        let offer = dev_b.selection_offer(SelectionKind::Clipboard).unwrap();
        let bad = offer.data(&DataFormat::image());
        let good = offer.data(&DataFormat::text());
        tb.pump_all();

        assert_eq!(
            bad.poll().unwrap().unwrap_err().error_kind(),
            ErrorKind::UnsupportedFormat
        );
        assert_eq!(good.poll().unwrap().unwrap(), b"hello");
    }

    fn teardown_with_pending(count: usize) {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        let mut source = StaticSource::new();
        source.push(DataFormat::text(), b"payload".to_vec());
        assert!(dev_a.set_selection(SelectionKind::Clipboard, Rc::new(source)));
        ta.pump_all();

        let offer = dev_b.selection_offer(SelectionKind::Clipboard).unwrap();
        // Resolve the format list first so every request below is a real
        // native fetch in flight.
        offer.formats().wait().unwrap();

        let requests: Vec<_> = (0..count).map(|_| offer.data(&DataFormat::text())).collect();
        assert_eq!(tb.open_handles(), count as i64);

        // A new owner appears; the cached offer is stale and every pending
        // request fails atomically.
        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("replacement")));
        ta.pump_all();

        for request in &requests {
            assert_eq!(
                request.poll().unwrap().unwrap_err().error_kind(),
                ErrorKind::OwnershipLost
            );
        }
        assert_eq!(tb.open_handles(), 0, "native handles leaked on teardown");
        assert!(!offer.is_alive());
    }

    #[test]
    fn offer_teardown_fails_all_pending_requests() {
        for count in [0, 1, 5] {
            teardown_with_pending(count);
        }
    }

    #[test]
    fn canceling_chained_fetch_leaves_shared_enumeration_intact() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("hello")));
        ta.pump_all();

        let offer = dev_b.selection_offer(SelectionKind::Clipboard).unwrap();
        let formats = offer.formats();
        let chained = offer.data(&DataFormat::text());

        // Cancel the chained fetch before the enumeration resolved.
        drop(chained);
        tb.pump_all();

        // The shared enumeration still answers the formats request, and no
        // fetch was issued for the canceled chain.
        let list = formats.poll().unwrap().unwrap();
        assert!(list.iter().any(|format| format.matches(&DataFormat::text())));
        assert_eq!(tb.open_handles(), 0);
        assert_eq!(tb.total_opened(), 1, "only the enumeration went native");
    }

    #[test]
    fn ownership_loss_is_silent_and_idempotent() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        assert!(dev_a.set_selection(SelectionKind::Clipboard, text_source("mine")));
        assert!(dev_b.set_selection(SelectionKind::Clipboard, text_source("now mine")));
        ta.pump_all();

        // A lost ownership releases the source without anything to clear.
        dev_a.clear_selection(SelectionKind::Clipboard);
        dev_a.clear_selection(SelectionKind::Clipboard);

        let offer = dev_a.selection_offer(SelectionKind::Clipboard).expect("b owns it now");
        let payload = offer.data(&DataFormat::text()).wait().unwrap();
        assert_eq!(payload, b"now mine");
    }

    #[derive(Default)]
    struct RecordingListener {
        accept: Option<DataFormat>,
        entered: Cell<u32>,
        moves: Cell<u32>,
        left: Cell<u32>,
        dropped: RefCell<Option<(DataOffer, Position)>>,
    }

    impl DndListener for RecordingListener {
        fn dnd_enter(&self, _offer: &DataOffer, _position: Position) {
            self.entered.set(self.entered.get() + 1);
        }

        fn dnd_move(&self, _offer: &DataOffer, _position: Position) -> Option<DataFormat> {
            self.moves.set(self.moves.get() + 1);
            self.accept.clone()
        }

        fn dnd_leave(&self, _offer: &DataOffer) {
            self.left.set(self.left.get() + 1);
        }

        fn dnd_drop(&self, offer: DataOffer, position: Position) {
            *self.dropped.borrow_mut() = Some((offer, position));
        }
    }

    #[test]
    fn drag_reject_returns_to_idle_without_drop() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        let listener = Rc::new(RecordingListener::default()); // accepts nothing
        let window = WindowId(7);
        dev_b.register_dnd_listener(window, listener.clone());

        dev_a.start_drag(text_source("dragged"), WindowId(1)).unwrap();
        ta.simulate_motion(Some(window), Position::new(10, 10));
        ta.pump_all();

        assert_eq!(listener.entered.get(), 1);
        assert_eq!(listener.moves.get(), 1);
        let feedback = dev_a.drag_feedback().expect("target answered");
        assert!(!feedback.accepted);

        // Pointer leaves the window, then the button is released over
        // nothing.
        ta.simulate_motion(None, Position::new(500, 500));
        ta.pump_all();
        assert_eq!(listener.left.get(), 1);

        ta.simulate_release(Position::new(500, 500));
        ta.pump_all();

        assert!(listener.dropped.borrow().is_none());
        assert_eq!(ta.grab_releases(), 1);
        // The session is idle again: a new gesture can start.
        dev_a.start_drag(text_source("again"), WindowId(1)).unwrap();
    }

    #[test]
    fn drag_accept_and_drop_delivers_the_payload() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        let listener = Rc::new(RecordingListener {
            accept: Some(DataFormat::text()),
            ..Default::default()
        });
        let window = WindowId(9);
        dev_b.register_dnd_listener(window, listener.clone());

        dev_a.start_drag(text_source("payload"), WindowId(1)).unwrap();
        ta.simulate_motion(Some(window), Position::new(10, 10));
        ta.pump_all();

        let feedback = dev_a.drag_feedback().expect("target answered");
        assert!(feedback.accepted);

        ta.simulate_motion(Some(window), Position::new(20, 20));
        ta.pump_all();

        ta.simulate_release(Position::new(20, 20));
        ta.pump_all();

        let (offer, position) = listener.dropped.borrow_mut().take().expect("drop delivered");
        assert_eq!(position, Position::new(20, 20));

        let payload = offer.data(&DataFormat::text()).wait().unwrap();
        assert_eq!(payload, b"payload");

        // The source session only finishes once the receiver acknowledges.
        assert_eq!(ta.grab_releases(), 0);
        offer.finish();
        tb.pump_all();
        assert_eq!(ta.grab_releases(), 1);

        // Both sides are reusable.
        dev_a.start_drag(text_source("next"), WindowId(1)).unwrap();
    }

    #[test]
    fn dropped_offer_acknowledges_even_without_finish() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        let listener = Rc::new(RecordingListener {
            accept: Some(DataFormat::text()),
            ..Default::default()
        });
        let window = WindowId(3);
        dev_b.register_dnd_listener(window, listener.clone());

        dev_a.start_drag(text_source("abandoned"), WindowId(1)).unwrap();
        ta.simulate_motion(Some(window), Position::new(5, 5));
        ta.pump_all();
        ta.simulate_release(Position::new(5, 5));
        ta.pump_all();

        // The application drops the offer without consuming it; the peer
        // still gets its acknowledgement and the source still finishes.
        let (offer, _) = listener.dropped.borrow_mut().take().unwrap();
        drop(offer);
        tb.pump_all();
        assert_eq!(ta.grab_releases(), 1);
    }

    #[test]
    fn stale_status_answers_are_discarded() {
        let (ta, tb) = pair();
        let dev_a = DataDevice::new(ta.clone());
        let dev_b = DataDevice::new(tb.clone());

        let listener = Rc::new(RecordingListener {
            accept: Some(DataFormat::text()),
            ..Default::default()
        });
        let window = WindowId(4);
        dev_b.register_dnd_listener(window, listener.clone());

        dev_a.start_drag(text_source("x"), WindowId(1)).unwrap();
        ta.simulate_motion(Some(window), Position::new(1, 1));
        ta.pump_all();
        assert!(dev_a.drag_feedback().is_some());

        // Target answers another position update, but the pointer leaves
        // before the answer crosses the wire.
        ta.simulate_motion(Some(window), Position::new(2, 2));
        // Deliver the motion to the target and let it queue its status reply.
        tb.transport_pump_n(1);
        ta.simulate_motion(None, Position::new(900, 900));
        assert!(dev_a.drag_feedback().is_none(), "feedback reset on target change");

        ta.pump_all();
        assert!(
            dev_a.drag_feedback().is_none(),
            "status for a left target must be discarded"
        );

        ta.simulate_release(Position::new(900, 900));
        ta.pump_all();
        assert_eq!(ta.grab_releases(), 1);
    }

    impl LoopbackTransport {
        fn transport_pump_n(&self, n: usize) {
            for _ in 0..n {
                self.wire.pump_one().unwrap();
            }
        }
    }
}

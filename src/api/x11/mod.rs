//! ICCCM selections and XDND over Xlib.
//!
//! The transport owns a hidden 1x1 proxy window through which all selection
//! traffic flows. The host's event loop forwards every event it reads to
//! [`X11Transport::handle_event`]; events addressed to foreign windows are
//! ignored, so forwarding unconditionally is fine.
//!
//! Fetches are `XConvertSelection` round trips against rotating transfer
//! properties on the proxy window, with INCR assembly for large payloads.
//! Drags speak XDND version 5.

mod atoms;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::os::raw::{c_int, c_long, c_uchar, c_ulong};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use x11_dl::xlib::{
    Atom, ButtonRelease, ButtonReleaseMask, ClientMessage, CurrentTime, Display, GrabModeAsync,
    GrabSuccess, MotionNotify, NoEventMask, PointerMotionMask, PropModeReplace, PropertyChangeMask,
    PropertyNewValue, PropertyNotify, SelectionClear, SelectionNotify, SelectionRequest, Time,
    Window, XClientMessageEvent, XEvent, XPointer, XSelectionEvent, XSelectionRequestEvent, Xlib,
    XA_ATOM, XA_PRIMARY,
};

use crate::drag::DndAction;
use crate::error::{ErrorKind, Result};
use crate::format::{DataFormat, Kind};
use crate::request::{AsyncRequest, CallbackQueue, Completer};
use crate::selection::SelectionKind;
use crate::transport::{
    NativeName, OwnerToken, Position, Transport, TransportHandler, WindowId,
};

use self::atoms::Atoms;

/// The XLIB handle.
static XLIB: Lazy<Option<Xlib>> = Lazy::new(|| Xlib::open().ok());

const XDND_VERSION: c_long = 5;

/// How long a sent drop waits for the peer's XdndFinished before the session
/// is finished locally.
const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Transfer properties rotate so that a bounded number of atoms serves any
/// number of concurrent fetches.
const TRANSFER_SLOTS: u64 = 8;

enum ConvertReply {
    Targets(Completer<Vec<NativeName>>),
    Data(Completer<Vec<u8>>),
}

struct PendingConvert {
    selection: Atom,
    target: Atom,
    property: Atom,
    reply: ConvertReply,
    /// Accumulates chunks once the owner switched the transfer to INCR.
    incr: Option<Vec<u8>>,
    canceled: Rc<Cell<bool>>,
}

#[derive(Default)]
struct DragSourceWire {
    awaiting_finish: Option<Instant>,
}

#[derive(Default)]
struct DragTargetWire {
    source: Option<Window>,
    /// Our window the drag entered, echoed back in XdndStatus/XdndFinished.
    window: Option<Window>,
    /// XdndEnter carries no pointer position, so the format announcement is
    /// held back until the first XdndPosition supplies a real one.
    pending_enter: Option<Vec<NativeName>>,
    last_position: Position,
    drop_time: Time,
}

impl DragTargetWire {
    /// The held-back enter announcement, taken exactly once.
    fn take_pending_enter(&mut self) -> Option<(Window, Vec<NativeName>)> {
        let window = self.window?;
        self.pending_enter.take().map(|names| (window, names))
    }
}

/// The X11 transport for one display connection.
pub struct X11Transport {
    xlib: &'static Xlib,
    display: *mut Display,
    root: Window,
    proxy: Window,
    atoms: Atoms,
    queue: CallbackQueue,
    handler: RefCell<Option<Weak<dyn TransportHandler>>>,
    converts: RefCell<Vec<PendingConvert>>,
    next_cookie: Cell<u64>,
    /// Last server timestamp seen on any event; ICCCM forbids CurrentTime
    /// where a real one is available.
    time: Cell<Time>,
    grabbed: Cell<bool>,
    source: RefCell<DragSourceWire>,
    target: RefCell<DragTargetWire>,
}

impl X11Transport {
    /// Wrap an existing display connection.
    ///
    /// # Safety
    ///
    /// `display` must be a valid connection that outlives the transport, and
    /// the transport must be driven from the thread dispatching its events.
    pub unsafe fn new(display: *mut Display) -> Result<Rc<Self>> {
        let xlib = XLIB
            .as_ref()
            .ok_or(ErrorKind::NotSupported("libX11 could not be loaded"))?;

        let atoms = Atoms::intern(xlib, display);
        let root = unsafe { (xlib.XDefaultRootWindow)(display) };
        let proxy =
            unsafe { (xlib.XCreateSimpleWindow)(display, root, -10, -10, 1, 1, 0, 0, 0) };
        unsafe {
            (xlib.XSelectInput)(display, proxy, PropertyChangeMask);
            (xlib.XFlush)(display);
        }

        debug!("x11 transport up, proxy window {proxy:#x}");
        Ok(Rc::new(Self {
            xlib,
            display,
            root,
            proxy,
            atoms,
            queue: CallbackQueue::default(),
            handler: RefCell::new(None),
            converts: RefCell::new(Vec::new()),
            next_cookie: Cell::new(0),
            time: Cell::new(CurrentTime),
            grabbed: Cell::new(false),
            source: RefCell::new(DragSourceWire::default()),
            target: RefCell::new(DragTargetWire::default()),
        }))
    }

    /// Mark a window as an XDND drop target.
    ///
    /// Must be called for every window that registers a drag listener;
    /// sources will not offer drops to unmarked windows.
    pub fn make_dnd_aware(&self, window: WindowId) {
        let version: c_ulong = XDND_VERSION as c_ulong;
        unsafe {
            (self.xlib.XChangeProperty)(
                self.display,
                window.0 as Window,
                self.atoms.xdnd_aware,
                XA_ATOM,
                32,
                PropModeReplace,
                &version as *const c_ulong as *const c_uchar,
                1,
            );
            (self.xlib.XFlush)(self.display);
        }
    }

    /// Dispatch one event from the host's loop. Events that do not concern
    /// the transport are ignored.
    pub fn handle_event(&self, event: &XEvent) {
        match event.get_type() {
            SelectionNotify => self.on_selection_notify(unsafe { &event.selection }),
            SelectionRequest => self.on_selection_request(unsafe { &event.selection_request }),
            SelectionClear => {
                let ev = unsafe { &event.selection_clear };
                self.time.set(ev.time);
                if let Some(kind) = self.kind_of(ev.selection) {
                    debug!("lost {kind:?} selection ownership");
                    if let Some(handler) = self.handler() {
                        handler.ownership_lost(kind);
                        handler.selection_changed(kind);
                    }
                }
            },
            PropertyNotify => {
                let ev = unsafe { &event.property };
                self.time.set(ev.time);
                if ev.window == self.proxy && ev.state == PropertyNewValue {
                    self.on_incr_chunk(ev.atom);
                }
            },
            ClientMessage => self.on_client_message(unsafe { &event.client_message }),
            MotionNotify if self.grabbed.get() => {
                let ev = unsafe { &event.motion };
                self.time.set(ev.time);
                let position = Position::new(ev.x_root, ev.y_root);
                let target = self.dnd_window_under(ev.x_root, ev.y_root);
                if let Some(handler) = self.handler() {
                    handler.source_motion(target.map(|window| WindowId(window as u64)), position);
                }
            },
            ButtonRelease if self.grabbed.get() => {
                let ev = unsafe { &event.button };
                self.time.set(ev.time);
                if let Some(handler) = self.handler() {
                    handler.source_released(Position::new(ev.x_root, ev.y_root));
                }
            },
            _ => {},
        }
    }

    /// Expire a sent drop whose peer never acknowledged. The host should
    /// call this from its timer tick while a drag is in flight.
    pub fn check_timeouts(&self) {
        let expired = {
            let mut source = self.source.borrow_mut();
            match source.awaiting_finish {
                Some(since) if since.elapsed() > FINISH_TIMEOUT => {
                    source.awaiting_finish = None;
                    true
                },
                _ => false,
            }
        };

        if expired {
            warn!("drop target never sent XdndFinished; finishing the session");
            if let Some(handler) = self.handler() {
                handler.drag_finished();
            }
        }
    }

    fn handler(&self) -> Option<Rc<dyn TransportHandler>> {
        self.handler.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn selection_atom(&self, kind: SelectionKind) -> Atom {
        match kind {
            SelectionKind::Clipboard => self.atoms.clipboard,
            SelectionKind::Primary => XA_PRIMARY,
            SelectionKind::Drag => self.atoms.xdnd_selection,
        }
    }

    fn kind_of(&self, atom: Atom) -> Option<SelectionKind> {
        if atom == self.atoms.clipboard {
            Some(SelectionKind::Clipboard)
        } else if atom == XA_PRIMARY {
            Some(SelectionKind::Primary)
        } else if atom == self.atoms.xdnd_selection {
            Some(SelectionKind::Drag)
        } else {
            None
        }
    }

    fn convert_time(&self, kind: SelectionKind) -> Time {
        if kind == SelectionKind::Drag {
            let time = self.target.borrow().drop_time;
            if time != CurrentTime {
                return time;
            }
        }
        self.time.get()
    }

    /// Kick off one `XConvertSelection` round trip.
    fn start_convert(&self, kind: SelectionKind, target: Atom, reply: ConvertReply) {
        let selection = self.selection_atom(kind);

        let cookie = self.next_cookie.get();
        self.next_cookie.set(cookie + 1);
        let property = atoms::intern(
            self.xlib,
            self.display,
            &format!("DATAPORT_PEND_{}", cookie % TRANSFER_SLOTS),
        );

        unsafe {
            (self.xlib.XConvertSelection)(
                self.display,
                selection,
                target,
                property,
                self.proxy,
                self.convert_time(kind),
            );
            (self.xlib.XFlush)(self.display);
        }

        self.converts.borrow_mut().push(PendingConvert {
            selection,
            target,
            property,
            reply,
            incr: None,
            canceled: Rc::new(Cell::new(false)),
        });
    }

    fn take_convert(&self, selection: Atom, target: Atom, property: Atom) -> Option<PendingConvert> {
        let mut converts = self.converts.borrow_mut();
        let index = converts
            .iter()
            .position(|convert| convert_matches(convert, selection, target, property))?;
        Some(converts.remove(index))
    }

    fn on_selection_notify(&self, ev: &XSelectionEvent) {
        self.time.set(ev.time);

        let mut convert = match self.take_convert(ev.selection, ev.target, ev.property) {
            Some(convert) => convert,
            None => {
                trace!("unsolicited SelectionNotify; ignoring");
                return;
            },
        };

        if convert.canceled.get() {
            if ev.property != 0 {
                self.delete_property(convert.property);
            }
            return;
        }

        if ev.property == 0 {
            // The owner refused the conversion.
            Self::fail_convert(convert, ErrorKind::TransportFailure);
            return;
        }

        let read = self.read_property(self.proxy, convert.property, true);
        match read {
            Some(prop) if prop.type_ == self.atoms.incr => {
                // Large transfer; chunks arrive as PropertyNotify events.
                trace!("selection transfer switched to INCR");
                convert.incr = Some(Vec::new());
                self.converts.borrow_mut().push(convert);
            },
            Some(prop) => self.complete_convert(convert, prop),
            None => Self::fail_convert(convert, ErrorKind::TransportFailure),
        }
    }

    fn on_incr_chunk(&self, property: Atom) {
        let position = self
            .converts
            .borrow()
            .iter()
            .position(|convert| convert.property == property && convert.incr.is_some());
        let index = match position {
            Some(index) => index,
            None => return,
        };

        let prop = self.read_property(self.proxy, property, true);
        let mut converts = self.converts.borrow_mut();
        match prop {
            Some(prop) if prop.bytes.is_empty() => {
                // Zero-length chunk terminates the INCR transfer.
                let mut convert = converts.remove(index);
                let bytes = convert.incr.take().unwrap_or_default();
                drop(converts);
                if !convert.canceled.get() {
                    self.complete_convert(convert, PropertyData {
                        type_: prop.type_,
                        format: 8,
                        bytes,
                    });
                }
            },
            Some(prop) => {
                if let Some(buffer) = converts[index].incr.as_mut() {
                    buffer.extend_from_slice(&prop.bytes);
                }
            },
            None => {
                let convert = converts.remove(index);
                drop(converts);
                Self::fail_convert(convert, ErrorKind::TransportFailure);
            },
        }
    }

    fn complete_convert(&self, convert: PendingConvert, prop: PropertyData) {
        match convert.reply {
            ConvertReply::Targets(completer) => {
                let names = atoms_of(&prop.bytes)
                    .into_iter()
                    .filter_map(|atom| atoms::name_of(self.xlib, self.display, atom))
                    .filter(|name| name != "TARGETS" && name != "MULTIPLE")
                    .collect::<Vec<_>>();
                trace!("selection owner offers {} target(s)", names.len());
                completer.complete(Ok(names));
            },
            ConvertReply::Data(completer) => completer.complete(Ok(prop.bytes)),
        }
    }

    fn fail_convert(convert: PendingConvert, kind: ErrorKind) {
        match convert.reply {
            ConvertReply::Targets(completer) => completer.complete(Err(kind.into())),
            ConvertReply::Data(completer) => completer.complete(Err(kind.into())),
        }
    }

    // Serving the selections we own.

    fn on_selection_request(&self, ev: &XSelectionRequestEvent) {
        self.time.set(ev.time);

        let kind = match self.kind_of(ev.selection) {
            Some(kind) => kind,
            None => return,
        };

        // ICCCM: an obsolete client may pass property None; use the target.
        let property = if ev.property != 0 { ev.property } else { ev.target };

        let ok = if ev.target == self.atoms.targets {
            self.answer_targets(kind, ev.requestor, property)
        } else if ev.target == self.atoms.multiple {
            self.answer_multiple(kind, ev.requestor, property)
        } else {
            self.answer_data(kind, ev.requestor, property, ev.target)
        };

        let mut reply: XSelectionEvent = unsafe { mem::zeroed() };
        reply.type_ = SelectionNotify;
        reply.display = self.display;
        reply.requestor = ev.requestor;
        reply.selection = ev.selection;
        reply.target = ev.target;
        reply.property = if ok { property } else { 0 };
        reply.time = ev.time;

        unsafe {
            (self.xlib.XSendEvent)(
                self.display,
                ev.requestor,
                0,
                NoEventMask,
                &mut reply as *mut XSelectionEvent as *mut XEvent,
            );
            (self.xlib.XFlush)(self.display);
        }
    }

    fn answer_targets(&self, kind: SelectionKind, requestor: Window, property: Atom) -> bool {
        let handler = match self.handler() {
            Some(handler) => handler,
            None => return false,
        };

        let mut targets = vec![self.atoms.targets, self.atoms.multiple];
        for name in handler.serve_formats(kind) {
            let atom = self.name_to_atom(&name);
            targets.push(atom);
            if atom == self.atoms.utf8_string {
                // Legacy text requestors ask for STRING or TEXT.
                targets.push(self.atoms.string);
                targets.push(self.atoms.text);
            }
        }

        self.change_property_atoms(requestor, property, &targets);
        true
    }

    fn answer_multiple(&self, kind: SelectionKind, requestor: Window, property: Atom) -> bool {
        let pairs = match self.read_property(requestor, property, false) {
            Some(prop) if prop.type_ == self.atoms.atom_pair => atoms_of(&prop.bytes),
            _ => {
                warn!("MULTIPLE request without a valid ATOM_PAIR property");
                return false;
            },
        };

        let mut patched = pairs.clone();
        for pair in patched.chunks_mut(2) {
            if let [target, dest] = pair {
                if !self.answer_data(kind, requestor, *dest, *target) {
                    // Per ICCCM the failed entry is replaced with None.
                    *dest = 0;
                }
            }
        }

        self.change_property_atoms(requestor, property, &patched);
        true
    }

    fn answer_data(
        &self,
        kind: SelectionKind,
        requestor: Window,
        property: Atom,
        target: Atom,
    ) -> bool {
        let handler = match self.handler() {
            Some(handler) => handler,
            None => return false,
        };
        let name = match atoms::name_of(self.xlib, self.display, target) {
            Some(name) => name,
            None => return false,
        };

        let payload = match handler.serve_data(kind, &name) {
            Some(payload) => payload,
            None => return false,
        };

        unsafe {
            (self.xlib.XChangeProperty)(
                self.display,
                requestor,
                property,
                target,
                8,
                PropModeReplace,
                payload.as_ptr(),
                payload.len() as c_int,
            );
        }
        true
    }

    // XDND.

    fn on_client_message(&self, ev: &XClientMessageEvent) {
        let atoms = &self.atoms;
        if ev.message_type == atoms.xdnd_enter {
            self.on_xdnd_enter(ev);
        } else if ev.message_type == atoms.xdnd_position {
            self.on_xdnd_position(ev);
        } else if ev.message_type == atoms.xdnd_leave {
            let mut target = self.target.borrow_mut();
            // A leave before any position means the engine never saw the
            // enter; there is nothing to report.
            let announced =
                target.source.take().is_some() && target.pending_enter.take().is_none();
            drop(target);
            if announced {
                if let Some(handler) = self.handler() {
                    handler.drag_left();
                }
            }
        } else if ev.message_type == atoms.xdnd_drop {
            self.on_xdnd_drop(ev);
        } else if ev.message_type == atoms.xdnd_status {
            self.on_xdnd_status(ev);
        } else if ev.message_type == atoms.xdnd_finished {
            self.source.borrow_mut().awaiting_finish = None;
            if let Some(handler) = self.handler() {
                handler.drag_finished();
            }
        }
    }

    fn on_xdnd_enter(&self, ev: &XClientMessageEvent) {
        let source = ev.data.get_long(0) as Window;
        let flags = ev.data.get_long(1);
        let version = (flags >> 24).min(XDND_VERSION);
        let has_type_list = flags & 1 != 0;

        let format_atoms = if has_type_list {
            match self.read_property(source, self.atoms.xdnd_type_list, false) {
                Some(prop) if prop.type_ == XA_ATOM => atoms_of(&prop.bytes),
                _ => {
                    warn!("XdndEnter announced a type list the source does not carry");
                    Vec::new()
                },
            }
        } else {
            (2..5).map(|index| ev.data.get_long(index) as Atom).filter(|atom| *atom != 0).collect()
        };

        let names: Vec<NativeName> = format_atoms
            .into_iter()
            .filter_map(|atom| atoms::name_of(self.xlib, self.display, atom))
            .collect();

        debug!("xdnd v{version} enter from {source:#x} with {} format(s)", names.len());
        let mut target = self.target.borrow_mut();
        *target = DragTargetWire {
            source: Some(source),
            window: Some(ev.window),
            pending_enter: Some(names),
            last_position: Position::default(),
            drop_time: CurrentTime,
        };
    }

    fn on_xdnd_position(&self, ev: &XClientMessageEvent) {
        let packed = ev.data.get_long(2);
        let position = Position::new((packed >> 16) as i32, (packed & 0xffff) as i32);
        self.time.set(ev.data.get_long(3) as Time);

        let entered = {
            let mut target = self.target.borrow_mut();
            if target.source != Some(ev.data.get_long(0) as Window) {
                trace!("XdndPosition from a source that never entered; ignoring");
                return;
            }
            target.last_position = position;
            target.take_pending_enter()
        };

        if let Some(handler) = self.handler() {
            if let Some((window, names)) = entered {
                handler.drag_entered(WindowId(window as u64), position, Some(names));
            }
            handler.drag_moved(position);
        }
    }

    fn on_xdnd_drop(&self, ev: &XClientMessageEvent) {
        let (position, entered) = {
            let mut target = self.target.borrow_mut();
            if target.source != Some(ev.data.get_long(0) as Window) {
                trace!("XdndDrop from a source that never entered; ignoring");
                return;
            }
            target.drop_time = ev.data.get_long(2) as Time;
            (target.last_position, target.take_pending_enter())
        };

        if let Some(handler) = self.handler() {
            // A degenerate source may drop without ever sending a position.
            if let Some((window, names)) = entered {
                handler.drag_entered(WindowId(window as u64), position, Some(names));
            }
            handler.drag_dropped(position);
        }
    }

    fn on_xdnd_status(&self, ev: &XClientMessageEvent) {
        let accepted = ev.data.get_long(1) & 1 != 0;
        let action = self.action_of(ev.data.get_long(4) as Atom);
        if let Some(handler) = self.handler() {
            // XdndStatus does not echo a format.
            handler.drag_status(accepted, None, action);
        }
    }

    fn send_xdnd(&self, window: Window, message_type: Atom, data: [c_long; 5]) {
        let mut event: XClientMessageEvent = unsafe { mem::zeroed() };
        event.type_ = ClientMessage;
        event.display = self.display;
        event.window = window;
        event.message_type = message_type;
        event.format = 32;
        for (index, value) in data.iter().enumerate() {
            event.data.set_long(index, *value);
        }

        unsafe {
            (self.xlib.XSendEvent)(
                self.display,
                window,
                0,
                NoEventMask,
                &mut event as *mut XClientMessageEvent as *mut XEvent,
            );
            (self.xlib.XFlush)(self.display);
        }
    }

    /// The XdndAware version a window advertises, if any.
    fn xdnd_version_of(&self, window: Window) -> Option<c_long> {
        let prop = self.read_property(window, self.atoms.xdnd_aware, false)?;
        atoms_of(&prop.bytes).first().map(|version| (*version as c_long).min(XDND_VERSION))
    }

    /// The deepest XdndAware window under the root position, walking the
    /// window tree the way XDND sources are expected to.
    fn dnd_window_under(&self, x_root: c_int, y_root: c_int) -> Option<Window> {
        let mut current = self.root;
        let mut aware = None;

        loop {
            if self.xdnd_version_of(current).is_some() {
                aware = Some(current);
            }

            let mut child: Window = 0;
            let (mut cx, mut cy) = (0, 0);
            unsafe {
                (self.xlib.XTranslateCoordinates)(
                    self.display,
                    self.root,
                    current,
                    x_root,
                    y_root,
                    &mut cx,
                    &mut cy,
                    &mut child,
                );
            }
            if child == 0 || child == current {
                return aware;
            }
            current = child;
        }
    }

    fn action_atom(&self, action: DndAction) -> Atom {
        if action.contains(DndAction::COPY) {
            self.atoms.xdnd_action_copy
        } else if action.contains(DndAction::MOVE) {
            self.atoms.xdnd_action_move
        } else if action.contains(DndAction::LINK) {
            self.atoms.xdnd_action_link
        } else if action.contains(DndAction::ASK) {
            self.atoms.xdnd_action_ask
        } else {
            0
        }
    }

    fn action_of(&self, atom: Atom) -> DndAction {
        if atom == self.atoms.xdnd_action_move {
            DndAction::MOVE
        } else if atom == self.atoms.xdnd_action_link {
            DndAction::LINK
        } else if atom == self.atoms.xdnd_action_ask {
            DndAction::ASK
        } else {
            DndAction::COPY
        }
    }

    fn name_to_atom(&self, name: &str) -> Atom {
        match name {
            "UTF8_STRING" => self.atoms.utf8_string,
            "text/uri-list" => self.atoms.uri_list,
            "image/png" => self.atoms.png,
            "application/octet-stream" => self.atoms.octet_stream,
            other => atoms::intern(self.xlib, self.display, other),
        }
    }

    fn change_property_atoms(&self, window: Window, property: Atom, atoms: &[Atom]) {
        unsafe {
            (self.xlib.XChangeProperty)(
                self.display,
                window,
                property,
                XA_ATOM,
                32,
                PropModeReplace,
                atoms.as_ptr() as *const c_uchar,
                atoms.len() as c_int,
            );
        }
    }

    fn delete_property(&self, property: Atom) {
        unsafe {
            (self.xlib.XDeleteProperty)(self.display, self.proxy, property);
        }
    }

    fn read_property(&self, window: Window, property: Atom, delete: bool) -> Option<PropertyData> {
        let mut bytes = Vec::new();
        let mut actual_type: Atom = 0;
        let mut actual_format: c_int = 0;
        let mut offset: c_long = 0;

        loop {
            let mut nitems: c_ulong = 0;
            let mut bytes_after: c_ulong = 0;
            let mut data: *mut c_uchar = std::ptr::null_mut();

            let status = unsafe {
                (self.xlib.XGetWindowProperty)(
                    self.display,
                    window,
                    property,
                    offset,
                    0x1000_0000,
                    delete as c_int,
                    0, /* AnyPropertyType */
                    &mut actual_type,
                    &mut actual_format,
                    &mut nitems,
                    &mut bytes_after,
                    &mut data,
                )
            };
            if status != 0 || data.is_null() {
                return None;
            }

            let item_size = match actual_format {
                8 => 1,
                16 => 2,
                // 32-bit items occupy a long each in client memory.
                32 => mem::size_of::<c_ulong>(),
                _ => {
                    unsafe { (self.xlib.XFree)(data as *mut _) };
                    return None;
                },
            };

            let len = nitems as usize * item_size;
            bytes.extend_from_slice(unsafe { std::slice::from_raw_parts(data, len) });
            unsafe { (self.xlib.XFree)(data as *mut _) };

            if bytes_after == 0 {
                break;
            }
            offset += (nitems as c_long * actual_format as c_long) / 32;
        }

        Some(PropertyData { type_: actual_type, format: actual_format, bytes })
    }
}

/// Pair a `SelectionNotify` with the convert that requested it.
///
/// The reply echoes selection, target and property; a refusal carries
/// property `0`, so the target disambiguates overlapping fetches on one
/// selection.
fn convert_matches(convert: &PendingConvert, selection: Atom, target: Atom, property: Atom) -> bool {
    convert.selection == selection
        && convert.target == target
        && (convert.property == property || property == 0)
        && convert.incr.is_none()
}

struct PropertyData {
    type_: Atom,
    #[allow(dead_code)]
    format: c_int,
    bytes: Vec<u8>,
}

fn atoms_of(bytes: &[u8]) -> Vec<Atom> {
    bytes
        .chunks_exact(mem::size_of::<c_ulong>())
        .map(|chunk| c_ulong::from_ne_bytes(chunk.try_into().unwrap()) as Atom)
        .collect()
}

unsafe extern "C" fn is_proxy_event(
    _display: *mut Display,
    event: *mut XEvent,
    arg: XPointer,
) -> c_int {
    let proxy = unsafe { *(arg as *const Window) };
    (unsafe { (*event).any.window } == proxy) as c_int
}

impl Transport for X11Transport {
    fn bind(&self, handler: Weak<dyn TransportHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// Blocks until the next event addressed to the proxy window and
    /// dispatches it. Events for other windows stay queued for the host.
    fn pump(&self) -> Result<()> {
        let mut event: XEvent = unsafe { mem::zeroed() };
        unsafe {
            (self.xlib.XIfEvent)(
                self.display,
                &mut event,
                Some(is_proxy_event),
                &self.proxy as *const Window as XPointer,
            );
        }
        self.handle_event(&event);
        Ok(())
    }

    fn enumerate_formats(&self, selection: SelectionKind) -> AsyncRequest<Vec<NativeName>> {
        let (request, completer) = AsyncRequest::new(&self.queue);

        if self.selection_owner(selection).is_none() {
            completer.complete(Err(ErrorKind::OwnershipLost.into()));
            return request;
        }

        self.start_convert(selection, self.atoms.targets, ConvertReply::Targets(completer));
        self.install_cancel(&request);
        request
    }

    fn fetch_data(&self, selection: SelectionKind, name: &str) -> AsyncRequest<Vec<u8>> {
        let (request, completer) = AsyncRequest::new(&self.queue);

        if self.selection_owner(selection).is_none() {
            completer.complete(Err(ErrorKind::OwnershipLost.into()));
            return request;
        }

        let target = self.name_to_atom(name);
        self.start_convert(selection, target, ConvertReply::Data(completer));
        self.install_cancel(&request);
        request
    }

    fn acquire_ownership(&self, selection: SelectionKind) -> bool {
        let atom = self.selection_atom(selection);
        unsafe {
            (self.xlib.XSetSelectionOwner)(self.display, atom, self.proxy, self.time.get());
            // Fail closed: only a confirming read proves the acquisition
            // was not raced away.
            (self.xlib.XGetSelectionOwner)(self.display, atom) == self.proxy
        }
    }

    fn release_ownership(&self, selection: SelectionKind) {
        let atom = self.selection_atom(selection);
        unsafe {
            if (self.xlib.XGetSelectionOwner)(self.display, atom) == self.proxy {
                (self.xlib.XSetSelectionOwner)(self.display, atom, 0, self.time.get());
                (self.xlib.XFlush)(self.display);
            }
        }
    }

    fn selection_owner(&self, selection: SelectionKind) -> Option<OwnerToken> {
        let atom = self.selection_atom(selection);
        let owner = unsafe { (self.xlib.XGetSelectionOwner)(self.display, atom) };
        (owner != 0).then_some(OwnerToken(owner as u64))
    }

    fn to_format(&self, native: &str) -> DataFormat {
        match native {
            "UTF8_STRING" | "STRING" | "TEXT" | "text/plain" | "text/plain;charset=utf-8" => {
                DataFormat::text()
            },
            "text/uri-list" => DataFormat::uri_list(),
            "image/png" => DataFormat::image(),
            "application/octet-stream" => DataFormat::raw(),
            other => DataFormat::new(other.to_owned()),
        }
    }

    fn from_format(&self, format: &DataFormat) -> Option<NativeName> {
        let name = match format.kind() {
            Kind::Text => "UTF8_STRING",
            Kind::UriList => "text/uri-list",
            Kind::Image => "image/png",
            Kind::Raw => "application/octet-stream",
            Kind::None => format.name(),
        };
        Some(name.to_owned())
    }

    fn grab_pointer(&self, origin: WindowId) -> Result<()> {
        let status = unsafe {
            (self.xlib.XGrabPointer)(
                self.display,
                origin.0 as Window,
                0,
                (ButtonReleaseMask | PointerMotionMask) as u32,
                GrabModeAsync,
                GrabModeAsync,
                0,
                0,
                self.time.get(),
            )
        };
        if status != GrabSuccess {
            return Err(ErrorKind::TransportFailure.into());
        }
        self.grabbed.set(true);
        Ok(())
    }

    fn release_grab(&self) {
        if self.grabbed.replace(false) {
            unsafe {
                (self.xlib.XUngrabPointer)(self.display, self.time.get());
                (self.xlib.XFlush)(self.display);
            }
        }
    }

    fn send_enter(&self, target: WindowId, formats: &[NativeName], _position: Position) {
        let window = target.0 as Window;
        let version = self.xdnd_version_of(window).unwrap_or(XDND_VERSION);

        let atoms: Vec<Atom> = formats.iter().map(|name| self.name_to_atom(name)).collect();
        let mut data = [0 as c_long; 5];
        data[0] = self.proxy as c_long;
        data[1] = version << 24;
        if atoms.len() > 3 {
            data[1] |= 1;
            self.change_property_atoms(self.proxy, self.atoms.xdnd_type_list, &atoms);
        } else {
            for (index, atom) in atoms.iter().enumerate() {
                data[2 + index] = *atom as c_long;
            }
        }

        trace!("xdnd enter to {window:#x}, version {version}");
        self.send_xdnd(window, self.atoms.xdnd_enter, data);
    }

    fn send_position(&self, target: WindowId, position: Position, actions: DndAction) {
        let data = [
            self.proxy as c_long,
            0,
            ((position.x as c_long) << 16) | (position.y as c_long & 0xffff),
            self.time.get() as c_long,
            self.action_atom(actions) as c_long,
        ];
        self.send_xdnd(target.0 as Window, self.atoms.xdnd_position, data);
    }

    fn send_status(&self, accepted: Option<&str>, action: DndAction) {
        let (source, window) = {
            let target = self.target.borrow();
            match (target.source, target.window) {
                (Some(source), Some(window)) => (source, window),
                _ => return,
            }
        };

        let mut data = [0 as c_long; 5];
        data[0] = window as c_long;
        if accepted.is_some() {
            // Bit 0: will accept; bit 1: keep sending positions.
            data[1] = 0b11;
            data[4] = self.action_atom(action) as c_long;
        } else {
            data[1] = 0b10;
        }
        self.send_xdnd(source, self.atoms.xdnd_status, data);
    }

    fn send_leave(&self, target: WindowId) {
        self.send_xdnd(target.0 as Window, self.atoms.xdnd_leave, [
            self.proxy as c_long,
            0,
            0,
            0,
            0,
        ]);
    }

    fn send_drop(&self, target: WindowId) {
        self.source.borrow_mut().awaiting_finish = Some(Instant::now());
        self.send_xdnd(target.0 as Window, self.atoms.xdnd_drop, [
            self.proxy as c_long,
            0,
            self.time.get() as c_long,
            0,
            0,
        ]);
    }

    fn send_finished(&self, accepted: bool) {
        let (source, window) = {
            let mut target = self.target.borrow_mut();
            let pair = (target.source.take(), target.window.take());
            match pair {
                (Some(source), Some(window)) => (source, window),
                _ => return,
            }
        };

        let mut data = [0 as c_long; 5];
        data[0] = window as c_long;
        data[1] = accepted as c_long;
        if accepted {
            data[2] = self.atoms.xdnd_action_copy as c_long;
        }
        self.send_xdnd(source, self.atoms.xdnd_finished, data);
    }
}

impl X11Transport {
    fn install_cancel(&self, request: &AsyncRequest<impl Sized + 'static>) {
        // The canceled flag is shared with the pending record; a late
        // SelectionNotify for a canceled convert only cleans the property.
        if let Some(convert) = self.converts.borrow().last() {
            let flag = convert.canceled.clone();
            request.set_canceler(move || flag.set(true));
        }
    }
}

impl Drop for X11Transport {
    fn drop(&mut self) {
        unsafe {
            (self.xlib.XDestroyWindow)(self.display, self.proxy);
            (self.xlib.XFlush)(self.display);
        }
    }
}

impl fmt::Debug for X11Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X11Transport")
            .field("proxy", &self.proxy)
            .field("pending_converts", &self.converts.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(selection: Atom, target: Atom, property: Atom) -> PendingConvert {
        let queue = CallbackQueue::default();
        let (_request, completer) = AsyncRequest::<Vec<u8>>::new(&queue);
        PendingConvert {
            selection,
            target,
            property,
            reply: ConvertReply::Data(completer),
            incr: None,
            canceled: Rc::new(Cell::new(false)),
        }
    }

    #[test]
    fn reply_requires_selection_target_and_property() {
        let convert = pending(1, 10, 100);
        assert!(convert_matches(&convert, 1, 10, 100));
        assert!(!convert_matches(&convert, 2, 10, 100));
        assert!(!convert_matches(&convert, 1, 12, 100));
        assert!(!convert_matches(&convert, 1, 10, 101));
    }

    #[test]
    fn refusal_only_matches_the_refused_target() {
        // Two fetches in flight on one selection; the owner refuses the
        // second. The refusal must not consume the first convert.
        let first = pending(1, 10, 100);
        let second = pending(1, 11, 101);
        assert!(!convert_matches(&first, 1, 11, 0));
        assert!(convert_matches(&second, 1, 11, 0));
    }

    #[test]
    fn incr_converts_are_fed_by_property_events_only() {
        let mut convert = pending(1, 10, 100);
        convert.incr = Some(Vec::new());
        assert!(!convert_matches(&convert, 1, 10, 100));
    }

    #[test]
    fn enter_announcement_is_held_for_the_first_position() {
        let mut wire = DragTargetWire {
            source: Some(7),
            window: Some(9),
            pending_enter: Some(vec!["UTF8_STRING".to_owned()]),
            last_position: Position::default(),
            drop_time: CurrentTime,
        };

        let (window, names) = wire.take_pending_enter().unwrap();
        assert_eq!(window, 9);
        assert_eq!(names, ["UTF8_STRING"]);
        // Later positions only report motion.
        assert!(wire.take_pending_enter().is_none());
    }
}

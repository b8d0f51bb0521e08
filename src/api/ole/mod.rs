//! Win32 OLE transport.
//!
//! Clipboard content travels as an `IDataObject` through
//! `OleSetClipboard`/`OleGetClipboard`; drags through `DoDragDrop` and a
//! per-window registered `IDropTarget`. `windows-sys` exposes the OLE entry
//! points but no COM vtables, so the interfaces are laid out by hand in
//! [`data_object`] and [`drop_target`].
//!
//! Everything here is synchronous: requests complete before they are
//! returned, and `DoDragDrop` runs a nested modal dispatch. Engine callbacks
//! issued from inside that nesting are safe because callback delivery is
//! queue-and-drain.

pub(crate) mod data_object;
pub(crate) mod drop_target;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{DRAGDROP_S_DROP, HWND, S_OK};
use windows_sys::Win32::System::Com::{
    DATADIR_GET, DVASPECT_CONTENT, FORMATETC, STGMEDIUM, TYMED_HGLOBAL,
};
use windows_sys::Win32::System::DataExchange::{
    CountClipboardFormats, GetClipboardFormatNameW, GetClipboardSequenceNumber,
    RegisterClipboardFormatW,
};
use windows_sys::Win32::System::Memory::{
    GlobalAlloc, GlobalFree, GlobalLock, GlobalSize, GlobalUnlock, GMEM_MOVEABLE,
};
use windows_sys::Win32::System::Ole::{
    DoDragDrop, OleGetClipboard, OleInitialize, OleIsCurrentClipboard, OleSetClipboard,
    RegisterDragDrop, ReleaseStgMedium, RevokeDragDrop, CF_UNICODETEXT, DROPEFFECT_COPY,
    DROPEFFECT_MOVE,
};

use crate::drag::DndAction;
use crate::error::{Error, ErrorKind, Result};
use crate::format::{DataFormat, Kind};
use crate::request::{AsyncRequest, CallbackQueue};
use crate::selection::SelectionKind;
use crate::transport::{
    NativeName, OwnerToken, Position, Transport, TransportHandler, WindowId,
};

use self::data_object::{ComObject, DataObject};
use self::drop_target::{DropSource, DropTarget};

pub(crate) const IID_IUNKNOWN: GUID = GUID::from_u128(0x00000000_0000_0000_c000_000000000046);
pub(crate) const IID_IDATAOBJECT: GUID = GUID::from_u128(0x0000010e_0000_0000_c000_000000000046);
pub(crate) const IID_IENUMFORMATETC: GUID =
    GUID::from_u128(0x00000103_0000_0000_c000_000000000046);
pub(crate) const IID_IDROPTARGET: GUID = GUID::from_u128(0x00000122_0000_0000_c000_000000000046);
pub(crate) const IID_IDROPSOURCE: GUID = GUID::from_u128(0x00000121_0000_0000_c000_000000000046);

fn hresult_error(code: i32) -> Error {
    Error::new(Some(code as i64), None, ErrorKind::TransportFailure)
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// The transport's native naming scheme: `CF_UNICODETEXT` for the built-in
/// text format, registered clipboard-format names for everything else.
pub(crate) fn format_id(name: &str) -> u16 {
    if name == "CF_UNICODETEXT" {
        return CF_UNICODETEXT;
    }
    let wide = wide(name);
    let id = unsafe { RegisterClipboardFormatW(wide.as_ptr()) };
    id as u16
}

fn format_name(id: u16) -> Option<NativeName> {
    if id == CF_UNICODETEXT {
        return Some("CF_UNICODETEXT".to_owned());
    }
    let mut buffer = [0u16; 256];
    let len = unsafe { GetClipboardFormatNameW(id as u32, buffer.as_mut_ptr(), 256) };
    (len > 0).then(|| String::from_utf16_lossy(&buffer[..len as usize]))
}

pub(crate) fn formatetc(id: u16) -> FORMATETC {
    FORMATETC {
        cfFormat: id,
        ptd: std::ptr::null_mut(),
        dwAspect: DVASPECT_CONTENT as u32,
        lindex: -1,
        tymed: TYMED_HGLOBAL as u32,
    }
}

/// Copy a payload into a movable HGLOBAL. `CF_UNICODETEXT` carries
/// NUL-terminated UTF-16; the engine's text payloads are UTF-8.
pub(crate) fn hglobal_from_payload(id: u16, payload: &[u8]) -> Option<*mut c_void> {
    let bytes: Vec<u8> = if id == CF_UNICODETEXT {
        let text = String::from_utf8_lossy(payload);
        wide(&text).into_iter().flat_map(u16::to_le_bytes).collect()
    } else {
        payload.to_vec()
    };

    unsafe {
        let global = GlobalAlloc(GMEM_MOVEABLE, bytes.len());
        if global.is_null() {
            return None;
        }
        let dest = GlobalLock(global);
        if dest.is_null() {
            GlobalFree(global);
            return None;
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest as *mut u8, bytes.len());
        GlobalUnlock(global);
        Some(global)
    }
}

fn payload_from_hglobal(id: u16, global: *mut c_void) -> Option<Vec<u8>> {
    unsafe {
        let src = GlobalLock(global);
        if src.is_null() {
            return None;
        }
        let len = GlobalSize(global);
        let bytes = std::slice::from_raw_parts(src as *const u8, len).to_vec();
        GlobalUnlock(global);

        if id == CF_UNICODETEXT {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .take_while(|unit| *unit != 0)
                .collect();
            Some(String::from_utf16_lossy(&units).into_bytes())
        } else {
            Some(bytes)
        }
    }
}

/// The answer the engine gave to the current DragOver, consumed
/// synchronously by the drop target to fill `*pdwEffect`.
#[derive(Clone, Copy, Default)]
pub(crate) struct TargetAnswer {
    pub accepted: bool,
    pub action: DndAction,
}

/// The OLE transport for one thread's clipboard and drag traffic.
pub struct OleTransport {
    queue: CallbackQueue,
    handler: RefCell<Option<Weak<dyn TransportHandler>>>,
    /// Our installed clipboard object, kept alive until replaced.
    clipboard: Cell<*mut DataObject>,
    /// The foreign data object of an incoming drag, AddRef'd from DragEnter
    /// until the finished acknowledgement.
    incoming: Cell<*mut c_void>,
    /// Our drag payload, armed by `acquire_ownership(Drag)` and consumed by
    /// [`perform_drag`](Self::perform_drag).
    outgoing: Cell<*mut DataObject>,
    targets: RefCell<HashMap<u64, *mut DropTarget>>,
    answer: Cell<TargetAnswer>,
    dragging: Cell<bool>,
}

impl OleTransport {
    /// Initialize OLE for the calling thread and build the transport.
    pub fn new() -> Result<Rc<Self>> {
        let code = unsafe { OleInitialize(std::ptr::null_mut()) };
        if code != S_OK {
            return Err(hresult_error(code));
        }

        debug!("ole transport up");
        Ok(Rc::new(Self {
            queue: CallbackQueue::default(),
            handler: RefCell::new(None),
            clipboard: Cell::new(std::ptr::null_mut()),
            incoming: Cell::new(std::ptr::null_mut()),
            outgoing: Cell::new(std::ptr::null_mut()),
            targets: RefCell::new(HashMap::new()),
            answer: Cell::new(TargetAnswer::default()),
            dragging: Cell::new(false),
        }))
    }

    /// Register a window as a drop target. The transport keeps the COM
    /// object alive until [`revoke_drop_target`](Self::revoke_drop_target).
    pub fn register_drop_target(self: &Rc<Self>, window: WindowId) -> Result<()> {
        let target = DropTarget::create(Rc::downgrade(self), window);
        let code = unsafe { RegisterDragDrop(window.0 as HWND, target as *mut c_void) };
        if code != S_OK {
            unsafe { ComObject::release(target as *mut c_void) };
            return Err(hresult_error(code));
        }
        if let Some(old) = self.targets.borrow_mut().insert(window.0, target) {
            unsafe { ComObject::release(old as *mut c_void) };
        }
        Ok(())
    }

    pub fn revoke_drop_target(&self, window: WindowId) {
        if let Some(target) = self.targets.borrow_mut().remove(&window.0) {
            unsafe {
                RevokeDragDrop(window.0 as HWND);
                ComObject::release(target as *mut c_void);
            }
        }
    }

    /// Host notification that the clipboard content changed, the
    /// `WM_CLIPBOARDUPDATE` handler. Detects loss of our installed object
    /// and refreshes the engine's remote-offer cache.
    pub fn clipboard_updated(&self) {
        let object = self.clipboard.get();
        if !object.is_null() {
            let code = unsafe { OleIsCurrentClipboard(object as *mut c_void) };
            if code != S_OK {
                debug!("clipboard object replaced by a peer");
                self.clipboard.set(std::ptr::null_mut());
                unsafe { ComObject::release(object as *mut c_void) };
                if let Some(handler) = self.handler() {
                    handler.ownership_lost(SelectionKind::Clipboard);
                }
            }
        }
        if let Some(handler) = self.handler() {
            handler.selection_changed(SelectionKind::Clipboard);
        }
    }

    /// Run the armed drag. Blocks inside `DoDragDrop`'s nested dispatch
    /// until the gesture ends, then finishes the engine session.
    ///
    /// The host calls this right after
    /// [`DataDevice::start_drag`](crate::device::DataDevice::start_drag)
    /// returned successfully.
    pub fn perform_drag(&self) -> Result<bool> {
        let object = self.outgoing.replace(std::ptr::null_mut());
        if object.is_null() {
            return Err(ErrorKind::BadState.into());
        }

        let source = DropSource::create();
        let mut effect = 0u32;
        let code = unsafe {
            DoDragDrop(
                object as *mut c_void,
                source as *mut c_void,
                DROPEFFECT_COPY | DROPEFFECT_MOVE,
                &mut effect,
            )
        };
        unsafe {
            ComObject::release(source as *mut c_void);
            ComObject::release(object as *mut c_void);
        }

        let accepted = code == DRAGDROP_S_DROP;
        debug!("drag gesture ended, accepted: {accepted}");
        if let Some(handler) = self.handler() {
            handler.drag_finished();
        }
        Ok(accepted)
    }

    pub(crate) fn handler(&self) -> Option<Rc<dyn TransportHandler>> {
        self.handler.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn target_answer(&self) -> TargetAnswer {
        self.answer.get()
    }

    /// DragEnter on a registered window: keep the foreign object for the
    /// fetches to come and hand the engine its format list.
    pub(crate) fn drag_arrived(&self, window: WindowId, object: *mut c_void, position: Position) {
        let previous = self.incoming.replace(object);
        if !previous.is_null() {
            unsafe { ComObject::release(previous) };
        }

        self.answer.set(TargetAnswer::default());
        let names = enumerate_object(object);
        if let Some(handler) = self.handler() {
            handler.drag_entered(window, position, Some(names));
        }
    }

    pub(crate) fn drag_over(&self, position: Position) {
        if let Some(handler) = self.handler() {
            handler.drag_moved(position);
        }
    }

    pub(crate) fn drag_gone(&self) {
        if let Some(handler) = self.handler() {
            handler.drag_left();
        }
        self.release_incoming();
    }

    pub(crate) fn drag_released(&self, position: Position) {
        if let Some(handler) = self.handler() {
            handler.drag_dropped(position);
        }
        // The incoming object stays referenced; the application's fetches
        // run against it until the deferred finished acknowledgement.
    }

    fn release_incoming(&self) {
        let object = self.incoming.replace(std::ptr::null_mut());
        if !object.is_null() {
            unsafe { ComObject::release(object) };
        }
    }

    /// The live foreign data object for `kind`, AddRef'd for the caller.
    fn object_of(&self, kind: SelectionKind) -> Option<*mut c_void> {
        match kind {
            SelectionKind::Clipboard => {
                let mut object: *mut c_void = std::ptr::null_mut();
                let code = unsafe { OleGetClipboard(&mut object) };
                (code == S_OK && !object.is_null()).then_some(object)
            },
            SelectionKind::Drag => {
                let object = self.incoming.get();
                if object.is_null() {
                    return None;
                }
                unsafe { ComObject::add_ref(object) };
                Some(object)
            },
            SelectionKind::Primary => None,
        }
    }
}

/// The format list of a foreign data object, restricted to HGLOBAL-capable
/// entries.
fn enumerate_object(object: *mut c_void) -> Vec<NativeName> {
    let mut names = Vec::new();
    unsafe {
        let mut enumerator: *mut c_void = std::ptr::null_mut();
        if ComObject::enum_format_etc(object, DATADIR_GET as u32, &mut enumerator) != S_OK
            || enumerator.is_null()
        {
            return names;
        }

        let mut etc: FORMATETC = std::mem::zeroed();
        while ComObject::enum_next(enumerator, 1, &mut etc, std::ptr::null_mut()) == S_OK {
            if etc.tymed & TYMED_HGLOBAL as u32 != 0 {
                if let Some(name) = format_name(etc.cfFormat) {
                    names.push(name);
                }
            }
        }
        ComObject::release(enumerator);
    }
    names
}

fn fetch_from_object(object: *mut c_void, name: &str) -> Result<Vec<u8>> {
    let id = format_id(name);
    let etc = formatetc(id);
    let mut medium: STGMEDIUM = unsafe { std::mem::zeroed() };

    let code = unsafe { ComObject::get_data(object, &etc, &mut medium) };
    if code != S_OK {
        return Err(hresult_error(code));
    }

    let payload = if medium.tymed == TYMED_HGLOBAL as u32 {
        payload_from_hglobal(id, unsafe { medium.u.hGlobal })
    } else {
        None
    };
    unsafe { ReleaseStgMedium(&mut medium) };

    payload.ok_or_else(|| ErrorKind::TransportFailure.into())
}

impl Transport for OleTransport {
    fn bind(&self, handler: Weak<dyn TransportHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// Every request completes before it is handed out; a pending request
    /// can only mean a local bug, so the pump fails closed.
    fn pump(&self) -> Result<()> {
        Err(ErrorKind::NotSupported("the ole transport completes requests synchronously").into())
    }

    fn enumerate_formats(&self, selection: SelectionKind) -> AsyncRequest<Vec<NativeName>> {
        let result = match self.object_of(selection) {
            Some(object) => {
                let names = enumerate_object(object);
                unsafe { ComObject::release(object) };
                Ok(names)
            },
            None => Err(ErrorKind::OwnershipLost.into()),
        };
        AsyncRequest::completed(&self.queue, result)
    }

    fn fetch_data(&self, selection: SelectionKind, name: &str) -> AsyncRequest<Vec<u8>> {
        let result = match self.object_of(selection) {
            Some(object) => {
                let payload = fetch_from_object(object, name);
                unsafe { ComObject::release(object) };
                payload
            },
            None => Err(ErrorKind::OwnershipLost.into()),
        };
        AsyncRequest::completed(&self.queue, result)
    }

    fn acquire_ownership(&self, selection: SelectionKind) -> bool {
        let handler = match self.handler() {
            Some(handler) => handler,
            None => return false,
        };
        let names = handler.serve_formats(selection);
        if names.is_empty() {
            warn!("refusing to own {selection:?} with no advertised formats");
            return false;
        }

        match selection {
            SelectionKind::Clipboard => {
                let object = DataObject::create(Rc::downgrade(&handler), selection, &names);
                let code = unsafe { OleSetClipboard(object as *mut c_void) };
                if code != S_OK {
                    unsafe { ComObject::release(object as *mut c_void) };
                    warn!("OleSetClipboard failed: {code:#x}");
                    return false;
                }
                let previous = self.clipboard.replace(object);
                if !previous.is_null() {
                    unsafe { ComObject::release(previous as *mut c_void) };
                }
                true
            },
            SelectionKind::Drag => {
                let object = DataObject::create(Rc::downgrade(&handler), selection, &names);
                let previous = self.outgoing.replace(object);
                if !previous.is_null() {
                    unsafe { ComObject::release(previous as *mut c_void) };
                }
                true
            },
            SelectionKind::Primary => false,
        }
    }

    fn release_ownership(&self, selection: SelectionKind) {
        match selection {
            SelectionKind::Clipboard => {
                let object = self.clipboard.replace(std::ptr::null_mut());
                if !object.is_null() {
                    unsafe {
                        OleSetClipboard(std::ptr::null_mut());
                        ComObject::release(object as *mut c_void);
                    }
                }
            },
            SelectionKind::Drag => {
                let object = self.outgoing.replace(std::ptr::null_mut());
                if !object.is_null() {
                    unsafe { ComObject::release(object as *mut c_void) };
                }
            },
            SelectionKind::Primary => {},
        }
    }

    fn selection_owner(&self, selection: SelectionKind) -> Option<OwnerToken> {
        match selection {
            SelectionKind::Clipboard => {
                let formats = unsafe { CountClipboardFormats() };
                if formats <= 0 {
                    return None;
                }
                // The sequence number bumps on every clipboard change, which
                // is exactly the cache-invalidation signal the engine wants.
                let sequence = unsafe { GetClipboardSequenceNumber() };
                Some(OwnerToken(u64::from(sequence)))
            },
            SelectionKind::Drag => {
                let object = self.incoming.get();
                (!object.is_null()).then(|| OwnerToken(object as u64))
            },
            SelectionKind::Primary => None,
        }
    }

    fn to_format(&self, native: &str) -> DataFormat {
        match native {
            "CF_UNICODETEXT" | "text/plain;charset=utf-8" | "text/plain" => DataFormat::text(),
            "text/uri-list" => DataFormat::uri_list(),
            "image/png" | "PNG" => DataFormat::image(),
            "application/octet-stream" => DataFormat::raw(),
            other => DataFormat::new(other.to_owned()),
        }
    }

    fn from_format(&self, format: &DataFormat) -> Option<NativeName> {
        let name = match format.kind() {
            Kind::Text => "CF_UNICODETEXT",
            Kind::UriList => "text/uri-list",
            Kind::Image => "image/png",
            Kind::Raw => "application/octet-stream",
            Kind::None => format.name(),
        };
        Some(name.to_owned())
    }

    fn grab_pointer(&self, _origin: WindowId) -> Result<()> {
        // DoDragDrop owns the pointer; there is nothing to take here.
        if self.outgoing.get().is_null() {
            return Err(ErrorKind::BadState.into());
        }
        self.dragging.set(true);
        Ok(())
    }

    fn release_grab(&self) {
        self.dragging.set(false);
    }

    fn send_enter(&self, _target: WindowId, _formats: &[NativeName], _position: Position) {}

    fn send_position(&self, _target: WindowId, _position: Position, _actions: DndAction) {}

    /// Recorded for the drop target to translate into the DragOver effect.
    fn send_status(&self, accepted: Option<&str>, action: DndAction) {
        self.answer.set(TargetAnswer { accepted: accepted.is_some(), action });
    }

    fn send_leave(&self, _target: WindowId) {}

    fn send_drop(&self, _target: WindowId) {}

    fn send_finished(&self, accepted: bool) {
        trace!("drop consumed, accepted: {accepted}");
        self.release_incoming();
    }
}

impl Drop for OleTransport {
    fn drop(&mut self) {
        let targets = std::mem::take(&mut *self.targets.borrow_mut());
        for (window, target) in targets {
            unsafe {
                RevokeDragDrop(window as HWND);
                ComObject::release(target as *mut c_void);
            }
        }
        self.release_incoming();
        self.release_ownership(SelectionKind::Clipboard);
        self.release_ownership(SelectionKind::Drag);
    }
}

impl fmt::Debug for OleTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OleTransport")
            .field("drop_targets", &self.targets.borrow().len())
            .field("dragging", &self.dragging.get())
            .finish()
    }
}

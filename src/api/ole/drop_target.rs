//! The `IDropTarget` and `IDropSource` ends of an OLE drag.
//!
//! One [`DropTarget`] is registered per host window; it feeds the engine's
//! target path and answers OLE synchronously from the engine's recorded
//! accept state. [`DropSource`] steers the modal `DoDragDrop` loop off the
//! physical mouse state.

#![allow(non_snake_case)]

use std::cell::Cell;
use std::ffi::c_void;
use std::rc::Weak;

use log::trace;
use windows_sys::core::{GUID, HRESULT};
use windows_sys::Win32::Foundation::{
    BOOL, DRAGDROP_S_CANCEL, DRAGDROP_S_DROP, DRAGDROP_S_USEDEFAULTCURSORS, E_NOINTERFACE,
    E_POINTER, POINTL, S_OK,
};
use windows_sys::Win32::System::Ole::{
    DROPEFFECT_COPY, DROPEFFECT_LINK, DROPEFFECT_MOVE, DROPEFFECT_NONE,
};
use windows_sys::Win32::System::SystemServices::MK_LBUTTON;

use crate::drag::DndAction;
use crate::transport::{Position, WindowId};

use super::data_object::{ComObject, IUnknownVtbl};
use super::{OleTransport, TargetAnswer, IID_IDROPSOURCE, IID_IDROPTARGET, IID_IUNKNOWN};

#[repr(C)]
pub(crate) struct IDropTargetVtbl {
    pub base: IUnknownVtbl,
    pub DragEnter: unsafe extern "system" fn(
        *mut c_void,
        *mut c_void,
        u32,
        POINTL,
        *mut u32,
    ) -> HRESULT,
    pub DragOver: unsafe extern "system" fn(*mut c_void, u32, POINTL, *mut u32) -> HRESULT,
    pub DragLeave: unsafe extern "system" fn(*mut c_void) -> HRESULT,
    pub Drop: unsafe extern "system" fn(
        *mut c_void,
        *mut c_void,
        u32,
        POINTL,
        *mut u32,
    ) -> HRESULT,
}

#[repr(C)]
pub(crate) struct IDropSourceVtbl {
    pub base: IUnknownVtbl,
    pub QueryContinueDrag: unsafe extern "system" fn(*mut c_void, BOOL, u32) -> HRESULT,
    pub GiveFeedback: unsafe extern "system" fn(*mut c_void, u32) -> HRESULT,
}

fn guid_eq(a: &GUID, b: &GUID) -> bool {
    a.data1 == b.data1 && a.data2 == b.data2 && a.data3 == b.data3 && a.data4 == b.data4
}

fn drop_effect(answer: TargetAnswer) -> u32 {
    if !answer.accepted {
        DROPEFFECT_NONE
    } else if answer.action.contains(DndAction::MOVE) {
        DROPEFFECT_MOVE
    } else if answer.action.contains(DndAction::LINK) {
        DROPEFFECT_LINK
    } else {
        DROPEFFECT_COPY
    }
}

/// The per-window drop target handed to `RegisterDragDrop`.
#[repr(C)]
pub(crate) struct DropTarget {
    vtbl: *const IDropTargetVtbl,
    refs: Cell<u32>,
    transport: Weak<OleTransport>,
    window: WindowId,
}

static DROP_TARGET_VTBL: IDropTargetVtbl = IDropTargetVtbl {
    base: IUnknownVtbl {
        QueryInterface: DropTarget::query_interface,
        AddRef: DropTarget::add_ref,
        Release: DropTarget::release,
    },
    DragEnter: DropTarget::drag_enter,
    DragOver: DropTarget::drag_over,
    DragLeave: DropTarget::drag_leave,
    Drop: DropTarget::drop,
};

impl DropTarget {
    pub(crate) fn create(transport: Weak<OleTransport>, window: WindowId) -> *mut Self {
        Box::into_raw(Box::new(Self {
            vtbl: &DROP_TARGET_VTBL,
            refs: Cell::new(1),
            transport,
            window,
        }))
    }

    unsafe extern "system" fn query_interface(
        this: *mut c_void,
        riid: *const GUID,
        out: *mut *mut c_void,
    ) -> HRESULT {
        if out.is_null() {
            return E_POINTER;
        }
        if guid_eq(&*riid, &IID_IUNKNOWN) || guid_eq(&*riid, &IID_IDROPTARGET) {
            Self::add_ref(this);
            *out = this;
            S_OK
        } else {
            *out = std::ptr::null_mut();
            E_NOINTERFACE
        }
    }

    unsafe extern "system" fn add_ref(this: *mut c_void) -> u32 {
        let object = &*(this as *const Self);
        let refs = object.refs.get() + 1;
        object.refs.set(refs);
        refs
    }

    unsafe extern "system" fn release(this: *mut c_void) -> u32 {
        let object = &*(this as *const Self);
        let refs = object.refs.get() - 1;
        object.refs.set(refs);
        if refs == 0 {
            drop(Box::from_raw(this as *mut Self));
        }
        refs
    }

    unsafe extern "system" fn drag_enter(
        this: *mut c_void,
        data: *mut c_void,
        _key_state: u32,
        point: POINTL,
        effect: *mut u32,
    ) -> HRESULT {
        if effect.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);
        let transport = match object.transport.upgrade() {
            Some(transport) => transport,
            None => {
                *effect = DROPEFFECT_NONE;
                return S_OK;
            },
        };

        let position = Position::new(point.x, point.y);
        trace!("ole drag entered window {:#x} at {position:?}", object.window.0);

        if !data.is_null() {
            ComObject::add_ref(data);
            transport.drag_arrived(object.window, data, position);
        }
        // The first position update pulls the listener's answer in before
        // OLE reads the effect.
        transport.drag_over(position);
        *effect = drop_effect(transport.target_answer());
        S_OK
    }

    unsafe extern "system" fn drag_over(
        this: *mut c_void,
        _key_state: u32,
        point: POINTL,
        effect: *mut u32,
    ) -> HRESULT {
        if effect.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);
        match object.transport.upgrade() {
            Some(transport) => {
                transport.drag_over(Position::new(point.x, point.y));
                *effect = drop_effect(transport.target_answer());
            },
            None => *effect = DROPEFFECT_NONE,
        }
        S_OK
    }

    unsafe extern "system" fn drag_leave(this: *mut c_void) -> HRESULT {
        let object = &*(this as *const Self);
        if let Some(transport) = object.transport.upgrade() {
            transport.drag_gone();
        }
        S_OK
    }

    unsafe extern "system" fn drop(
        this: *mut c_void,
        _data: *mut c_void,
        _key_state: u32,
        point: POINTL,
        effect: *mut u32,
    ) -> HRESULT {
        if effect.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);
        match object.transport.upgrade() {
            Some(transport) => {
                let answer = transport.target_answer();
                transport.drag_released(Position::new(point.x, point.y));
                *effect = drop_effect(answer);
            },
            None => *effect = DROPEFFECT_NONE,
        }
        S_OK
    }
}

/// Steers `DoDragDrop`: drop on button release, cancel on escape.
#[repr(C)]
pub(crate) struct DropSource {
    vtbl: *const IDropSourceVtbl,
    refs: Cell<u32>,
}

static DROP_SOURCE_VTBL: IDropSourceVtbl = IDropSourceVtbl {
    base: IUnknownVtbl {
        QueryInterface: DropSource::query_interface,
        AddRef: DropSource::add_ref,
        Release: DropSource::release,
    },
    QueryContinueDrag: DropSource::query_continue_drag,
    GiveFeedback: DropSource::give_feedback,
};

impl DropSource {
    pub(crate) fn create() -> *mut Self {
        Box::into_raw(Box::new(Self { vtbl: &DROP_SOURCE_VTBL, refs: Cell::new(1) }))
    }

    unsafe extern "system" fn query_interface(
        this: *mut c_void,
        riid: *const GUID,
        out: *mut *mut c_void,
    ) -> HRESULT {
        if out.is_null() {
            return E_POINTER;
        }
        if guid_eq(&*riid, &IID_IUNKNOWN) || guid_eq(&*riid, &IID_IDROPSOURCE) {
            Self::add_ref(this);
            *out = this;
            S_OK
        } else {
            *out = std::ptr::null_mut();
            E_NOINTERFACE
        }
    }

    unsafe extern "system" fn add_ref(this: *mut c_void) -> u32 {
        let object = &*(this as *const Self);
        let refs = object.refs.get() + 1;
        object.refs.set(refs);
        refs
    }

    unsafe extern "system" fn release(this: *mut c_void) -> u32 {
        let object = &*(this as *const Self);
        let refs = object.refs.get() - 1;
        object.refs.set(refs);
        if refs == 0 {
            drop(Box::from_raw(this as *mut Self));
        }
        refs
    }

    unsafe extern "system" fn query_continue_drag(
        _this: *mut c_void,
        escape_pressed: BOOL,
        key_state: u32,
    ) -> HRESULT {
        if escape_pressed != 0 {
            return DRAGDROP_S_CANCEL;
        }
        if key_state & MK_LBUTTON == 0 {
            return DRAGDROP_S_DROP;
        }
        S_OK
    }

    unsafe extern "system" fn give_feedback(_this: *mut c_void, _effect: u32) -> HRESULT {
        DRAGDROP_S_USEDEFAULTCURSORS
    }
}

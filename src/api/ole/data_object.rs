//! A hand-rolled `IDataObject` over the locally installed source.
//!
//! `windows-sys` models COM interfaces as bare `*mut c_void`, so the vtable
//! layouts live here. Objects are heap-allocated with an initial reference
//! count of one and free themselves on the last `Release`.

#![allow(non_snake_case)]

use std::cell::Cell;
use std::ffi::c_void;
use std::rc::Weak;

use log::trace;
use windows_sys::core::{GUID, HRESULT};
use windows_sys::Win32::Foundation::{
    BOOL, DV_E_FORMATETC, E_NOINTERFACE, E_NOTIMPL, E_OUTOFMEMORY, E_POINTER, E_UNEXPECTED,
    OLE_E_ADVISENOTSUPPORTED, S_FALSE, S_OK,
};
use windows_sys::Win32::System::Com::{DATADIR_GET, FORMATETC, STGMEDIUM, STGMEDIUM_0, TYMED_HGLOBAL};

use crate::selection::SelectionKind;
use crate::transport::{NativeName, TransportHandler};

use super::{
    formatetc, hglobal_from_payload, IID_IDATAOBJECT, IID_IENUMFORMATETC, IID_IUNKNOWN,
};

#[repr(C)]
pub(crate) struct IUnknownVtbl {
    pub QueryInterface:
        unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT,
    pub AddRef: unsafe extern "system" fn(*mut c_void) -> u32,
    pub Release: unsafe extern "system" fn(*mut c_void) -> u32,
}

#[repr(C)]
pub(crate) struct IDataObjectVtbl {
    pub base: IUnknownVtbl,
    pub GetData:
        unsafe extern "system" fn(*mut c_void, *const FORMATETC, *mut STGMEDIUM) -> HRESULT,
    pub GetDataHere:
        unsafe extern "system" fn(*mut c_void, *const FORMATETC, *mut STGMEDIUM) -> HRESULT,
    pub QueryGetData: unsafe extern "system" fn(*mut c_void, *const FORMATETC) -> HRESULT,
    pub GetCanonicalFormatEtc:
        unsafe extern "system" fn(*mut c_void, *const FORMATETC, *mut FORMATETC) -> HRESULT,
    pub SetData:
        unsafe extern "system" fn(*mut c_void, *const FORMATETC, *const STGMEDIUM, BOOL) -> HRESULT,
    pub EnumFormatEtc: unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void) -> HRESULT,
    pub DAdvise: unsafe extern "system" fn(
        *mut c_void,
        *const FORMATETC,
        u32,
        *mut c_void,
        *mut u32,
    ) -> HRESULT,
    pub DUnadvise: unsafe extern "system" fn(*mut c_void, u32) -> HRESULT,
    pub EnumDAdvise: unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> HRESULT,
}

#[repr(C)]
pub(crate) struct IEnumFormatEtcVtbl {
    pub base: IUnknownVtbl,
    pub Next: unsafe extern "system" fn(*mut c_void, u32, *mut FORMATETC, *mut u32) -> HRESULT,
    pub Skip: unsafe extern "system" fn(*mut c_void, u32) -> HRESULT,
    pub Reset: unsafe extern "system" fn(*mut c_void) -> HRESULT,
    pub Clone: unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> HRESULT,
}

fn guid_eq(a: &GUID, b: &GUID) -> bool {
    a.data1 == b.data1 && a.data2 == b.data2 && a.data3 == b.data3 && a.data4 == b.data4
}

/// Typed calls through foreign COM pointers.
pub(crate) struct ComObject;

impl ComObject {
    pub(crate) unsafe fn add_ref(object: *mut c_void) -> u32 {
        ((**(object as *mut *const IUnknownVtbl)).AddRef)(object)
    }

    pub(crate) unsafe fn release(object: *mut c_void) -> u32 {
        ((**(object as *mut *const IUnknownVtbl)).Release)(object)
    }

    pub(crate) unsafe fn get_data(
        object: *mut c_void,
        etc: *const FORMATETC,
        medium: *mut STGMEDIUM,
    ) -> HRESULT {
        ((**(object as *mut *const IDataObjectVtbl)).GetData)(object, etc, medium)
    }

    pub(crate) unsafe fn enum_format_etc(
        object: *mut c_void,
        direction: u32,
        out: *mut *mut c_void,
    ) -> HRESULT {
        ((**(object as *mut *const IDataObjectVtbl)).EnumFormatEtc)(object, direction, out)
    }

    pub(crate) unsafe fn enum_next(
        enumerator: *mut c_void,
        count: u32,
        out: *mut FORMATETC,
        fetched: *mut u32,
    ) -> HRESULT {
        ((**(enumerator as *mut *const IEnumFormatEtcVtbl)).Next)(enumerator, count, out, fetched)
    }
}

/// The data object advertising and rendering the installed source.
///
/// Payloads render on demand: `GetData` routes through the engine's serving
/// path, so the source callback runs only for the format a consumer actually
/// takes.
#[repr(C)]
pub(crate) struct DataObject {
    vtbl: *const IDataObjectVtbl,
    refs: Cell<u32>,
    handler: Weak<dyn TransportHandler>,
    selection: SelectionKind,
    formats: Vec<(u16, NativeName)>,
}

static DATA_OBJECT_VTBL: IDataObjectVtbl = IDataObjectVtbl {
    base: IUnknownVtbl {
        QueryInterface: DataObject::query_interface,
        AddRef: DataObject::add_ref,
        Release: DataObject::release,
    },
    GetData: DataObject::get_data,
    GetDataHere: DataObject::get_data_here,
    QueryGetData: DataObject::query_get_data,
    GetCanonicalFormatEtc: DataObject::get_canonical_format_etc,
    SetData: DataObject::set_data,
    EnumFormatEtc: DataObject::enum_format_etc,
    DAdvise: DataObject::d_advise,
    DUnadvise: DataObject::d_unadvise,
    EnumDAdvise: DataObject::enum_d_advise,
};

impl DataObject {
    pub(crate) fn create(
        handler: Weak<dyn TransportHandler>,
        selection: SelectionKind,
        names: &[NativeName],
    ) -> *mut Self {
        let formats = names
            .iter()
            .map(|name| (super::format_id(name), name.clone()))
            .collect();
        Box::into_raw(Box::new(Self {
            vtbl: &DATA_OBJECT_VTBL,
            refs: Cell::new(1),
            handler,
            selection,
            formats,
        }))
    }

    fn name_of(&self, id: u16) -> Option<&str> {
        self.formats
            .iter()
            .find(|(format, _)| *format == id)
            .map(|(_, name)| name.as_str())
    }

    unsafe extern "system" fn query_interface(
        this: *mut c_void,
        riid: *const GUID,
        out: *mut *mut c_void,
    ) -> HRESULT {
        if out.is_null() {
            return E_POINTER;
        }
        if guid_eq(&*riid, &IID_IUNKNOWN) || guid_eq(&*riid, &IID_IDATAOBJECT) {
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

    unsafe extern "system" fn get_data(
        this: *mut c_void,
        etc: *const FORMATETC,
        medium: *mut STGMEDIUM,
    ) -> HRESULT {
        if etc.is_null() || medium.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);
        let etc = &*etc;

        if etc.tymed & TYMED_HGLOBAL as u32 == 0 {
            return DV_E_FORMATETC;
        }
        let name = match object.name_of(etc.cfFormat) {
            Some(name) => name,
            None => return DV_E_FORMATETC,
        };

        let handler = match object.handler.upgrade() {
            Some(handler) => handler,
            None => return E_UNEXPECTED,
        };
        let payload = match handler.serve_data(object.selection, name) {
            Some(payload) => payload,
            None => return DV_E_FORMATETC,
        };
        trace!("rendering {name} for a peer, {} bytes", payload.len());

        let global = match hglobal_from_payload(etc.cfFormat, &payload) {
            Some(global) => global,
            None => return E_OUTOFMEMORY,
        };
        *medium = STGMEDIUM {
            tymed: TYMED_HGLOBAL as u32,
            u: STGMEDIUM_0 { hGlobal: global },
            pUnkForRelease: std::ptr::null_mut(),
        };
        S_OK
    }

    unsafe extern "system" fn get_data_here(
        _this: *mut c_void,
        _etc: *const FORMATETC,
        _medium: *mut STGMEDIUM,
    ) -> HRESULT {
        E_NOTIMPL
    }

    unsafe extern "system" fn query_get_data(this: *mut c_void, etc: *const FORMATETC) -> HRESULT {
        if etc.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);
        let etc = &*etc;
        if etc.tymed & TYMED_HGLOBAL as u32 != 0 && object.name_of(etc.cfFormat).is_some() {
            S_OK
        } else {
            DV_E_FORMATETC
        }
    }

    unsafe extern "system" fn get_canonical_format_etc(
        _this: *mut c_void,
        _etc: *const FORMATETC,
        _out: *mut FORMATETC,
    ) -> HRESULT {
        E_NOTIMPL
    }

    unsafe extern "system" fn set_data(
        _this: *mut c_void,
        _etc: *const FORMATETC,
        _medium: *const STGMEDIUM,
        _release: BOOL,
    ) -> HRESULT {
        E_NOTIMPL
    }

    unsafe extern "system" fn enum_format_etc(
        this: *mut c_void,
        direction: u32,
        out: *mut *mut c_void,
    ) -> HRESULT {
        if out.is_null() {
            return E_POINTER;
        }
        if direction != DATADIR_GET as u32 {
            *out = std::ptr::null_mut();
            return E_NOTIMPL;
        }
        let object = &*(this as *const Self);
        let formats = object.formats.iter().map(|(id, _)| formatetc(*id)).collect();
        *out = EnumFormats::create(formats, 0) as *mut c_void;
        S_OK
    }

    unsafe extern "system" fn d_advise(
        _this: *mut c_void,
        _etc: *const FORMATETC,
        _flags: u32,
        _sink: *mut c_void,
        _connection: *mut u32,
    ) -> HRESULT {
        OLE_E_ADVISENOTSUPPORTED
    }

    unsafe extern "system" fn d_unadvise(_this: *mut c_void, _connection: u32) -> HRESULT {
        OLE_E_ADVISENOTSUPPORTED
    }

    unsafe extern "system" fn enum_d_advise(_this: *mut c_void, out: *mut *mut c_void) -> HRESULT {
        if !out.is_null() {
            *out = std::ptr::null_mut();
        }
        OLE_E_ADVISENOTSUPPORTED
    }
}

/// The enumerator handed out by [`DataObject::enum_format_etc`].
#[repr(C)]
struct EnumFormats {
    vtbl: *const IEnumFormatEtcVtbl,
    refs: Cell<u32>,
    formats: Vec<FORMATETC>,
    index: Cell<usize>,
}

static ENUM_FORMATS_VTBL: IEnumFormatEtcVtbl = IEnumFormatEtcVtbl {
    base: IUnknownVtbl {
        QueryInterface: EnumFormats::query_interface,
        AddRef: EnumFormats::add_ref,
        Release: EnumFormats::release,
    },
    Next: EnumFormats::next,
    Skip: EnumFormats::skip,
    Reset: EnumFormats::reset,
    Clone: EnumFormats::clone,
};

impl EnumFormats {
    fn create(formats: Vec<FORMATETC>, index: usize) -> *mut Self {
        Box::into_raw(Box::new(Self {
            vtbl: &ENUM_FORMATS_VTBL,
            refs: Cell::new(1),
            formats,
            index: Cell::new(index),
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
        if guid_eq(&*riid, &IID_IUNKNOWN) || guid_eq(&*riid, &IID_IENUMFORMATETC) {
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

    unsafe extern "system" fn next(
        this: *mut c_void,
        count: u32,
        out: *mut FORMATETC,
        fetched: *mut u32,
    ) -> HRESULT {
        if out.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);

        let mut taken = 0u32;
        while taken < count {
            let index = object.index.get();
            if index >= object.formats.len() {
                break;
            }
            *out.add(taken as usize) = object.formats[index];
            object.index.set(index + 1);
            taken += 1;
        }

        if !fetched.is_null() {
            *fetched = taken;
        }
        if taken == count {
            S_OK
        } else {
            S_FALSE
        }
    }

    unsafe extern "system" fn skip(this: *mut c_void, count: u32) -> HRESULT {
        let object = &*(this as *const Self);
        let index = object.index.get() + count as usize;
        if index <= object.formats.len() {
            object.index.set(index);
            S_OK
        } else {
            object.index.set(object.formats.len());
            S_FALSE
        }
    }

    unsafe extern "system" fn reset(this: *mut c_void) -> HRESULT {
        let object = &*(this as *const Self);
        object.index.set(0);
        S_OK
    }

    unsafe extern "system" fn clone(this: *mut c_void, out: *mut *mut c_void) -> HRESULT {
        if out.is_null() {
            return E_POINTER;
        }
        let object = &*(this as *const Self);
        *out = Self::create(object.formats.clone(), object.index.get()) as *mut c_void;
        S_OK
    }
}

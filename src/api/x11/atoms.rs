//! The per-connection atom table.
//!
//! All protocol atoms are interned in one batch when the transport comes up;
//! everything else (peer format names) is interned on demand.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use x11_dl::xlib::{Atom, Display, Xlib};

macro_rules! atom_table {
    ($( $field:ident => $name:expr, )*) => {
        #[derive(Debug, Clone, Copy)]
        pub(crate) struct Atoms {
            $( pub $field: Atom, )*
        }

        impl Atoms {
            pub(crate) fn intern(xlib: &Xlib, display: *mut Display) -> Self {
                const NAMES: &[&str] = &[$( $name, )*];
                let cstrings: Vec<CString> =
                    NAMES.iter().map(|name| CString::new(*name).unwrap()).collect();
                let mut pointers: Vec<*mut c_char> =
                    cstrings.iter().map(|name| name.as_ptr() as *mut c_char).collect();

                let mut atoms = vec![0 as Atom; NAMES.len()];
                unsafe {
                    (xlib.XInternAtoms)(
                        display,
                        pointers.as_mut_ptr(),
                        pointers.len() as _,
                        0,
                        atoms.as_mut_ptr(),
                    );
                }

                let mut iter = atoms.into_iter();
                Self { $( $field: iter.next().unwrap(), )* }
            }
        }
    };
}

atom_table! {
    clipboard => "CLIPBOARD",
    targets => "TARGETS",
    multiple => "MULTIPLE",
    incr => "INCR",
    atom_pair => "ATOM_PAIR",
    atom => "ATOM",
    utf8_string => "UTF8_STRING",
    string => "STRING",
    text => "TEXT",
    uri_list => "text/uri-list",
    png => "image/png",
    octet_stream => "application/octet-stream",
    transfer => "DATAPORT_TRANSFER",
    xdnd_aware => "XdndAware",
    xdnd_selection => "XdndSelection",
    xdnd_enter => "XdndEnter",
    xdnd_position => "XdndPosition",
    xdnd_status => "XdndStatus",
    xdnd_leave => "XdndLeave",
    xdnd_drop => "XdndDrop",
    xdnd_finished => "XdndFinished",
    xdnd_type_list => "XdndTypeList",
    xdnd_action_copy => "XdndActionCopy",
    xdnd_action_move => "XdndActionMove",
    xdnd_action_link => "XdndActionLink",
    xdnd_action_ask => "XdndActionAsk",
}

/// Intern one atom by name.
pub(crate) fn intern(xlib: &Xlib, display: *mut Display, name: &str) -> Atom {
    let name = CString::new(name).unwrap_or_default();
    unsafe { (xlib.XInternAtom)(display, name.as_ptr(), 0) }
}

/// The name of an atom, or a placeholder when the server does not know it.
pub(crate) fn name_of(xlib: &Xlib, display: *mut Display, atom: Atom) -> Option<String> {
    if atom == 0 {
        return None;
    }
    unsafe {
        let raw = (xlib.XGetAtomName)(display, atom);
        if raw.is_null() {
            return None;
        }
        let name = CStr::from_ptr(raw).to_string_lossy().into_owned();
        (xlib.XFree)(raw as *mut _);
        Some(name)
    }
}

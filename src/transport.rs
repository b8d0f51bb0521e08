//! The per-backend wire contract.
//!
//! A [`Transport`] translates the engine's abstract operations into native
//! protocol calls and owns every native handle; the engine above never sees
//! one. Inbound traffic flows the other way through [`TransportHandler`],
//! which the engine implements and the transport holds weakly.

use std::fmt;
use std::rc::Weak;

use crate::drag::DndAction;
use crate::error::Result;
use crate::format::DataFormat;
use crate::request::AsyncRequest;
use crate::selection::SelectionKind;

/// A format name in the transport's native naming scheme.
///
/// Mime types on Wayland, atom names on X11, clipboard-format names on
/// Win32. Translation to and from [`DataFormat`] is owned by the transport.
pub type NativeName = String;

/// Opaque token for a native window, minted by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

/// Opaque token identifying the current owner of a selection.
///
/// The engine only compares tokens for equality; a changed token means the
/// cached remote offer is stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken(pub u64);

/// A pointer position in the transport's drag coordinate space.
///
/// Root-relative on X11, surface-relative on Wayland, screen coordinates on
/// Win32; the engine only forwards it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// The engine's outbound view of one backend connection.
///
/// All methods are driven from the host's event loop thread. Operations
/// returning an [`AsyncRequest`] allocate native resources for the duration
/// of the round trip and release them exactly once, on completion or on
/// cancellation.
pub trait Transport {
    /// Attach the engine. Called once by the device; the transport keeps the
    /// handler weakly and silently drops inbound traffic after it is gone.
    fn bind(&self, handler: Weak<dyn TransportHandler>);

    /// One blocking dispatch step, used to resolve [`AsyncRequest::wait`].
    fn pump(&self) -> Result<()>;

    /// Ask the remote owner of `selection` for its format list.
    fn enumerate_formats(&self, selection: SelectionKind) -> AsyncRequest<Vec<NativeName>>;

    /// Fetch the payload for one native format from the remote owner.
    fn fetch_data(&self, selection: SelectionKind, name: &str) -> AsyncRequest<Vec<u8>>;

    /// Attempt to become the owner of `selection`.
    ///
    /// Must confirm exclusivity with whatever round trip the platform
    /// requires before reporting `true`, and fail closed otherwise. `false`
    /// leaves no side effects.
    fn acquire_ownership(&self, selection: SelectionKind) -> bool;

    /// Relinquish a previously acquired ownership. No-op when not owned.
    fn release_ownership(&self, selection: SelectionKind);

    /// The platform-reported owner of `selection`, if any.
    fn selection_owner(&self, selection: SelectionKind) -> Option<OwnerToken>;

    /// Translate a native format name into engine identity.
    fn to_format(&self, native: &str) -> DataFormat;

    /// Translate engine identity into the native name advertised or
    /// requested on the wire. `None` when the transport cannot express the
    /// format.
    fn from_format(&self, format: &DataFormat) -> Option<NativeName>;

    // Drag-specific operations.

    /// Capture the pointer for an outgoing drag gesture.
    fn grab_pointer(&self, origin: WindowId) -> Result<()>;

    /// Release the capture taken by [`grab_pointer`](Self::grab_pointer).
    fn release_grab(&self);

    /// Announce the drag to a newly hovered target window.
    fn send_enter(&self, target: WindowId, formats: &[NativeName], position: Position);

    /// Update the pointer position over the current target.
    fn send_position(&self, target: WindowId, position: Position, actions: DndAction);

    /// Answer the source's position update: the accepted native format, or
    /// `None` for reject.
    fn send_status(&self, accepted: Option<&str>, action: DndAction);

    /// Tell the hovered target the pointer left it.
    fn send_leave(&self, target: WindowId);

    /// Release the payload onto the current target.
    fn send_drop(&self, target: WindowId);

    /// Acknowledge a received drop back to the source.
    fn send_finished(&self, accepted: bool);
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// The engine's inbound surface, called by the transport while dispatching
/// native events.
pub trait TransportHandler {
    /// A peer asked which formats the locally owned source offers.
    fn serve_formats(&self, selection: SelectionKind) -> Vec<NativeName>;

    /// A peer asked for the payload of one native format. `None` fails the
    /// peer's request.
    fn serve_data(&self, selection: SelectionKind, name: &str) -> Option<Vec<u8>>;

    /// The platform revoked our ownership of `selection`.
    fn ownership_lost(&self, selection: SelectionKind);

    /// The platform reports a new or no owner for `selection`; cached offers
    /// are stale.
    fn selection_changed(&self, selection: SelectionKind);

    // Target side of a drag.

    /// A drag entered `window`. `formats` is the inline announcement if the
    /// protocol carries one; `None` means the engine must enumerate.
    fn drag_entered(&self, window: WindowId, position: Position, formats: Option<Vec<NativeName>>);

    /// The drag pointer moved over the entered window.
    fn drag_moved(&self, position: Position);

    /// The drag pointer left the entered window.
    fn drag_left(&self);

    /// The source released the payload over the entered window.
    fn drag_dropped(&self, position: Position);

    // Source side of a drag.

    /// The hovered target answered a position update.
    fn drag_status(&self, accepted: bool, format: Option<NativeName>, action: DndAction);

    /// The peer finished consuming the drop (or the platform timed out).
    fn drag_finished(&self);

    /// Pointer motion while this process drags: the window under the pointer
    /// per the platform's hit-test, or `None` over foreign territory.
    fn source_motion(&self, target: Option<WindowId>, position: Position);

    /// The pointer button ended the gesture.
    fn source_released(&self, position: Position);
}

impl fmt::Debug for dyn TransportHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandler").finish_non_exhaustive()
    }
}

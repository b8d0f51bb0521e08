//! The per-connection data device.
//!
//! A [`DataDevice`] is the application's entry point to the engine: one per
//! native connection, wiring the selection slots and the drag coordinator to
//! a [`Transport`]. The transport calls back in through the
//! [`TransportHandler`] implementation while the host's event loop
//! dispatches native events.

use std::fmt;
use std::rc::{Rc, Weak};

use log::warn;

use crate::drag::{DndAction, DndListener, DragCoordinator, StatusFeedback};
use crate::error::Result;
use crate::offer::DataOffer;
use crate::request::CallbackQueue;
use crate::selection::{SelectionKind, SelectionManager};
use crate::source::DataSource;
use crate::transport::{NativeName, Position, Transport, TransportHandler, WindowId};

/// The engine facade for one native connection.
pub struct DataDevice {
    shared: Rc<DeviceShared>,
}

pub(crate) struct DeviceShared {
    transport: Rc<dyn Transport>,
    queue: CallbackQueue,
    selections: SelectionManager,
    drag: DragCoordinator,
}

impl DataDevice {
    /// Wire the engine to a transport.
    pub fn new(transport: Rc<dyn Transport>) -> Self {
        let queue = CallbackQueue::default();
        let shared = Rc::new(DeviceShared {
            selections: SelectionManager::new(transport.clone(), queue.clone()),
            drag: DragCoordinator::new(transport.clone(), queue.clone()),
            transport: transport.clone(),
            queue,
        });

        transport.bind(Rc::downgrade(&shared) as Weak<dyn TransportHandler>);
        Self { shared }
    }

    /// Install `source` as the content of a selection slot.
    ///
    /// Returns `false` when the platform did not confirm exclusive
    /// ownership; the slot is untouched in that case. The engine keeps the
    /// source only until it is replaced or ownership is lost.
    pub fn set_selection(&self, kind: SelectionKind, source: Rc<dyn DataSource>) -> bool {
        if kind == SelectionKind::Drag {
            warn!("the drag selection is managed by start_drag, not set_selection");
            return false;
        }
        self.shared.selections.acquire(kind, source)
    }

    /// Explicitly clear a locally owned selection slot.
    pub fn clear_selection(&self, kind: SelectionKind) {
        self.shared.selections.clear(kind);
    }

    /// The offer for remotely owned content of `kind`, if there is an owner.
    pub fn selection_offer(&self, kind: SelectionKind) -> Option<DataOffer> {
        self.shared.selections.current(kind)
    }

    /// Begin a drag gesture with `source` as payload, originating from
    /// `origin`.
    pub fn start_drag(&self, source: Rc<dyn DataSource>, origin: WindowId) -> Result<()> {
        self.shared.drag.start(&self.shared.selections, source, origin)
    }

    /// The hovered target's latest accept/reject answer, for drag-cursor
    /// feedback.
    pub fn drag_feedback(&self) -> Option<StatusFeedback> {
        self.shared.drag.feedback()
    }

    /// Register the drag listener for a window.
    pub fn register_dnd_listener(&self, window: WindowId, listener: Rc<dyn DndListener>) {
        self.shared.drag.register_listener(window, listener);
    }

    /// Remove the drag listener of a window.
    pub fn unregister_dnd_listener(&self, window: WindowId) {
        self.shared.drag.unregister_listener(window);
    }

    /// The transport driving this device.
    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.shared.transport
    }
}

impl fmt::Debug for DataDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDevice")
            .field("selections", &self.shared.selections)
            .field("drag", &self.shared.drag)
            .finish()
    }
}

impl TransportHandler for DeviceShared {
    fn serve_formats(&self, selection: SelectionKind) -> Vec<NativeName> {
        let names = self.selections.serve_formats(selection);
        self.queue.drain();
        names
    }

    fn serve_data(&self, selection: SelectionKind, name: &str) -> Option<Vec<u8>> {
        let payload = self.selections.serve_data(selection, name);
        self.queue.drain();
        payload
    }

    fn ownership_lost(&self, selection: SelectionKind) {
        self.selections.ownership_lost(selection);
        self.queue.drain();
    }

    fn selection_changed(&self, selection: SelectionKind) {
        self.selections.invalidate_remote(selection);
        self.queue.drain();
    }

    fn drag_entered(&self, window: WindowId, position: Position, formats: Option<Vec<NativeName>>) {
        self.drag.entered(window, position, formats);
        self.queue.drain();
    }

    fn drag_moved(&self, position: Position) {
        self.drag.moved(position);
        self.queue.drain();
    }

    fn drag_left(&self) {
        self.drag.left();
        self.queue.drain();
    }

    fn drag_dropped(&self, position: Position) {
        self.drag.dropped(position);
        self.queue.drain();
    }

    fn drag_status(&self, accepted: bool, format: Option<NativeName>, action: DndAction) {
        self.drag.status(accepted, format, action);
        self.queue.drain();
    }

    fn drag_finished(&self) {
        self.drag.finished(&self.selections);
        self.queue.drain();
    }

    fn source_motion(&self, target: Option<WindowId>, position: Position) {
        self.drag.source_motion(target, position);
        self.queue.drain();
    }

    fn source_released(&self, position: Position) {
        self.drag.source_released(&self.selections, position);
        self.queue.drain();
    }
}

//! The purpose of this library is to move clipboard and drag-and-drop
//! payloads between independent processes on as many platforms as possible,
//! behind one format-negotiating engine.
//!
//! An application produces data through a [`DataSource`]: an ordered list of
//! offerable [`DataFormat`]s plus a lazy serializer for each of them. The
//! source is installed on a [`DataDevice`], either as the content of a
//! selection slot ([`DataDevice::set_selection`]) or as the payload of a drag
//! gesture ([`DataDevice::start_drag`]).
//!
//! Remote content arrives as a [`DataOffer`]: a proxy for a source owned by
//! another process (or another window of this one). Its format list and its
//! payloads are fetched asynchronously; every fetch is an [`AsyncRequest`]
//! which can be polled, blocked on, or given a completion callback, and which
//! cancels its native transfer when dropped.
//!
//! The engine itself never touches the wire. Each backend implements the
//! [`Transport`] contract — X11 selections with XDND, Wayland
//! `wl_data_device`, Win32 OLE drag-drop — and is driven by the host's event
//! loop. The engine is single-threaded per connection: completion callbacks
//! run on the loop-driving thread, queued so that they never interleave with
//! engine mutation.
//!
//! [`DataSource`]: crate::source::DataSource
//! [`DataFormat`]: crate::format::DataFormat
//! [`DataDevice`]: crate::device::DataDevice
//! [`DataDevice::set_selection`]: crate::device::DataDevice::set_selection()
//! [`DataDevice::start_drag`]: crate::device::DataDevice::start_drag()
//! [`DataOffer`]: crate::offer::DataOffer
//! [`AsyncRequest`]: crate::request::AsyncRequest
//! [`Transport`]: crate::transport::Transport

#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod api;
pub mod device;
pub mod drag;
pub mod error;
pub mod format;
pub mod offer;
pub mod request;
pub mod selection;
pub mod source;
pub mod transport;

#[cfg(test)]
pub(crate) mod loopback;

//! The platform transports.

#[cfg(windows_platform)]
pub mod ole;
#[cfg(wayland_platform)]
pub mod wayland;
#[cfg(x11_platform)]
pub mod x11;

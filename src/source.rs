//! Application-facing payload producers.

use std::fmt;

use crate::error::{ErrorKind, Result};
use crate::format::DataFormat;

/// A producer of offerable payloads, owned by the application.
///
/// The engine holds the installed source only for as long as it is the
/// content of a selection slot or of an active drag; it never caches the
/// produced bytes, so a source whose content is expensive to regenerate
/// should cache internally.
///
/// The transport may query one installed source for two different formats
/// with overlapping lifetimes. The engine is single-threaded, so the calls
/// never run in parallel, but an implementation must not assume that one
/// `data` call finished before the next format is requested.
pub trait DataSource {
    /// The offerable formats, ordered by producer preference with the most
    /// faithful representation first.
    ///
    /// The list must stay stable for the lifetime of the object.
    fn formats(&self) -> Vec<DataFormat>;

    /// Serialize the payload for one advertised format.
    ///
    /// Must be safe to invoke repeatedly and for distinct formats. Returns
    /// [`ErrorKind::UnsupportedFormat`] for a format outside the advertised
    /// list; the engine logs that as a protocol-level bug and fails only the
    /// affected request.
    ///
    /// [`ErrorKind::UnsupportedFormat`]: crate::error::ErrorKind::UnsupportedFormat
    fn data(&self, format: &DataFormat) -> Result<Vec<u8>>;

    /// Preview image metadata for the drag cursor, if any.
    fn drag_preview(&self) -> Option<DragPreview> {
        None
    }
}

impl fmt::Debug for dyn DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource").field("formats", &self.formats()).finish()
    }
}

/// Preview image shown next to the pointer during a drag.
#[derive(Clone)]
pub struct DragPreview {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Tightly packed RGBA8 pixels, row-major.
    pub rgba: Vec<u8>,
    /// Pointer position inside the image.
    pub hotspot: (i32, i32),
}

impl fmt::Debug for DragPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DragPreview")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("hotspot", &self.hotspot)
            .finish_non_exhaustive()
    }
}

/// A source over fixed, pre-serialized entries.
///
/// Convenient for plain clipboard text and for tests; anything that needs
/// lazy conversion implements [`DataSource`] directly.
#[derive(Debug, Default)]
pub struct StaticSource {
    entries: Vec<(DataFormat, Vec<u8>)>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A text-only source.
    pub fn text(text: impl Into<String>) -> Self {
        let mut source = Self::new();
        source.push(DataFormat::text(), text.into().into_bytes());
        source
    }

    /// Append an entry; insertion order is the preference order.
    pub fn push(&mut self, format: DataFormat, payload: Vec<u8>) {
        self.entries.push((format, payload));
    }
}

impl DataSource for StaticSource {
    fn formats(&self) -> Vec<DataFormat> {
        self.entries.iter().map(|(format, _)| format.clone()).collect()
    }

    fn data(&self, format: &DataFormat) -> Result<Vec<u8>> {
        self.entries
            .iter()
            .find(|(advertised, _)| advertised.matches(format))
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| ErrorKind::UnsupportedFormat.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_serves_advertised_formats() {
        let source = StaticSource::text("hello");
        assert_eq!(source.data(&DataFormat::text()).unwrap(), b"hello");
        // Alias of the advertised format resolves to the same payload.
        assert_eq!(source.data(&DataFormat::new("text/plain")).unwrap(), b"hello");
    }

    #[test]
    fn static_source_rejects_unadvertised_format() {
        let source = StaticSource::text("hello");
        let err = source.data(&DataFormat::image()).unwrap_err();
        assert_eq!(err.error_kind(), crate::error::ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn raw_round_trip_is_bit_exact() {
        let payload = vec![0u8, 155, 7, 255, 42];
        let mut source = StaticSource::new();
        source.push(DataFormat::raw(), payload.clone());
        assert_eq!(source.data(&DataFormat::raw()).unwrap(), payload);
    }
}

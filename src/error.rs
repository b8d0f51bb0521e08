//! Dataport error handling.

use std::fmt;

/// A specialized [`Result`] type for data-exchange operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all clipboard and drag-and-drop operations.
///
/// Failures never escape as process-fatal conditions; they surface as the
/// failed result of the one request that hit them.
#[derive(Debug, Clone)]
pub struct Error {
    /// The raw code of the underlying error.
    raw_code: Option<i64>,

    /// The raw message from the os in case it could be obtained.
    raw_os_message: Option<String>,

    /// The simplified error kind to handle matching.
    kind: ErrorKind,
}

impl Error {
    #[allow(dead_code)]
    pub(crate) fn new(
        raw_code: Option<i64>,
        raw_os_message: Option<String>,
        kind: ErrorKind,
    ) -> Self {
        Self { raw_code, raw_os_message, kind }
    }

    /// Helper to check that error is [`ErrorKind::NotSupported`].
    #[inline]
    pub fn not_supported(&self) -> bool {
        matches!(&self.kind, ErrorKind::NotSupported(_))
    }

    /// The underlying error kind.
    #[inline]
    pub fn error_kind(&self) -> ErrorKind {
        self.kind
    }

    /// The underlying raw code in case it's present.
    #[inline]
    pub fn raw_code(&self) -> Option<i64> {
        self.raw_code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(raw_code) = self.raw_code {
            write!(f, "[{raw_code:x}] ")?;
        }

        let msg = if let Some(raw_os_message) = self.raw_os_message.as_ref() {
            raw_os_message
        } else {
            self.kind.as_str()
        };

        write!(f, "{msg}")
    }
}

impl std::error::Error for Error {}

/// Build an error with just a kind.
impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { raw_code: None, raw_os_message: None, kind }
    }
}

/// A list specifying general categories of data-exchange errors.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ErrorKind {
    /// A format outside the advertised list was requested.
    ///
    /// This is a local protocol bug; the engine logs it and fails only the
    /// one request that asked for the format.
    UnsupportedFormat,

    /// The selection or offer was invalidated mid-flight.
    ///
    /// Raised for every pending request on an offer when the underlying
    /// session ends: the clipboard was cleared or replaced, the drag left,
    /// or the peer disconnected.
    OwnershipLost,

    /// A native call returned an error.
    ///
    /// Fails only the one in-flight request that issued the call.
    TransportFailure,

    /// An unsolicited or malformed native message arrived.
    ///
    /// The message is logged and ignored; only a request waiting
    /// specifically on that message fails with this kind.
    ProtocolViolation,

    /// The operation does not fit the current session state.
    ///
    /// For example starting a drag while another gesture is active.
    BadState,

    /// The operation is not supported by the platform.
    NotSupported(&'static str),

    /// The misc error that can't be classified occurred.
    Misc,
}

impl ErrorKind {
    pub(crate) fn as_str(&self) -> &'static str {
        use ErrorKind::*;
        match *self {
            UnsupportedFormat => "requested format is not advertised by the source",
            OwnershipLost => "the selection or offer is no longer valid",
            TransportFailure => "native transport call failed",
            ProtocolViolation => "unsolicited or malformed native message",
            BadState => "operation does not fit the current session state",
            NotSupported(reason) => reason,
            Misc => "misc platform error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned from various operations.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("I/O error: {0:?}")]
    IoError(::std::io::ErrorKind),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    /// Failure to parse a received frame into a [Message](crate::Message).
    #[error("Parse error")]
    Parse,

    /// A command exhausted its retry budget without a wire ACK, or a reply
    /// did not arrive in time.
    #[error("Operation timed out")]
    Timeout,

    /// The router link dropped while the operation was pending.
    #[error("Router was disconnected.")]
    Disconnected,

    /// A matrix, level, source or destination outside the configured bounds
    /// was rejected before any wire traffic.
    #[error("{field} {value} is out of range (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    /// `execute-salvo` named a salvo that does not exist.
    #[error("No salvo with id {0}")]
    UnknownSalvo(u32),
}

/// Failures opening or using the byte transport to the router.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("Router endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Permission denied opening {0}")]
    Permission(String),

    #[error("No such device or host: {0}")]
    NotFound(String),

    #[error("Transport I/O error: {0:?}")]
    Io(::std::io::ErrorKind),
}

/// Damage detected while deframing the byte stream. These are recovered
/// locally by the decoder (discard and resynchronise) and never fail a
/// client request directly.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq)]
pub enum FramingError {
    #[error("DLE followed by invalid byte {0:#04x}")]
    Escape(u8),

    #[error("Byte count {declared} does not match {actual} data bytes")]
    ByteCount { declared: u8, actual: usize },

    #[error("Checksum {received:#04x}, computed {computed:#04x}")]
    Checksum { received: u8, computed: u8 },

    #[error("Frame body too short ({0} bytes)")]
    Truncated(usize),

    #[error("Frame data too long ({0} bytes)")]
    Oversize(usize),
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        Error::IoError(e.kind())
    }
}

impl From<futures::channel::mpsc::SendError> for Error {
    fn from(_: futures::channel::mpsc::SendError) -> Error {
        Error::Disconnected
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Error {
        Error::Disconnected
    }
}

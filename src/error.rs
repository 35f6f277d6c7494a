use core::fmt::{self, Write as _};

use smoltcp::wire::IpEndpoint;

use crate::packet::{ErrorCode, Type, META_SIZE, PACKET_SIZE};

#[cfg(feature = "std")]
use std::{
    io::{Error as IoError, ErrorKind as IoErrorKind},
    path::PathBuf,
};

/// The longest message an ERROR packet can carry.
pub const MESSAGE_CAP: usize = PACKET_SIZE - META_SIZE;

/// Why a datagram could not be read (or written) as a TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Shorter than the minimum for its opcode.
    Truncated,
    UnknownOpcode(u16),
    /// A request with no NUL after the filename.
    MissingTerminator,
    EmptyFilename,
    /// Filename is empty or contains a NUL.
    InvalidFilename,
    InvalidMode,
    /// More than 512 bytes of data, or a packet that does not fit `PACKET_SIZE`.
    Oversized,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Malformed(Malformed),
    /// A DATA or ACK carried a block number other than the one expected.
    SequenceMismatch { expected: u16, received: u16 },
    /// The peer sent an ERROR packet. `message` holds its bytes as sent.
    Remote {
        code: ErrorCode,
        message: heapless::Vec<u8, MESSAGE_CAP>,
    },
    /// A well-formed packet that has no place in the current transfer.
    UnexpectedPacket(Type),
    /// An invalid TID.
    InvalidAddr(IpEndpoint),
    /// The outstanding block went unanswered after every retry.
    Timeout { block: u16 },
    /// The session was asked to do something its state does not allow.
    Illegal,
    /// A local file could not be opened, created or resolved.
    #[cfg(feature = "std")]
    Unavailable { path: PathBuf, source: IoError },
    #[cfg(feature = "std")]
    Io(IoError),
}

impl Error {
    /// Build a `Remote` error from the raw ERROR packet fields.
    pub fn remote(code: ErrorCode, message: &[u8]) -> Self {
        let mut bytes = heapless::Vec::new();
        // Decoded packets never exceed the capacity.
        let _ = bytes.extend_from_slice(&message[..message.len().min(MESSAGE_CAP)]);
        Error::Remote {
            code,
            message: bytes,
        }
    }

    /// The code reported to the peer when this error aborts a transfer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Malformed(_) | Error::UnexpectedPacket(_) | Error::SequenceMismatch { .. } => {
                ErrorCode::IllegalOperation
            }
            Error::InvalidAddr(_) => ErrorCode::UnknownTransferId,
            Error::Remote { code, .. } => *code,
            Error::Timeout { .. } | Error::Illegal => ErrorCode::NotDefined,
            #[cfg(feature = "std")]
            Error::Unavailable { source, .. } => code_for_io(source),
            #[cfg(feature = "std")]
            Error::Io(e) => code_for_io(e),
        }
    }
}

#[cfg(feature = "std")]
fn code_for_io(err: &IoError) -> ErrorCode {
    match err.kind() {
        IoErrorKind::NotFound => ErrorCode::FileNotFound,
        IoErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        IoErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        _ => ErrorCode::NotDefined,
    }
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformed::Truncated => f.write_str("packet too short for its opcode"),
            Malformed::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Malformed::MissingTerminator => f.write_str("missing NUL terminator"),
            Malformed::EmptyFilename => f.write_str("empty filename"),
            Malformed::InvalidFilename => f.write_str("filename is empty or contains NUL"),
            Malformed::InvalidMode => f.write_str("invalid transfer mode"),
            Malformed::Oversized => f.write_str("packet too large"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Malformed(m) => write!(f, "malformed packet: {m}"),
            Error::SequenceMismatch { expected, received } => {
                write!(f, "expected block {expected}, got {received}")
            }
            Error::Remote { code, message } => {
                write!(f, "peer error {}: ", u16::from(*code))?;
                for chunk in message.utf8_chunks() {
                    f.write_str(chunk.valid())?;
                    if !chunk.invalid().is_empty() {
                        f.write_char(char::REPLACEMENT_CHARACTER)?;
                    }
                }
                Ok(())
            }
            Error::UnexpectedPacket(type_) => write!(f, "unexpected {type_:?} packet"),
            Error::InvalidAddr(endpoint) => write!(f, "packet from unknown endpoint {endpoint}"),
            Error::Timeout { block } => write!(f, "timed out waiting on block {block}"),
            Error::Illegal => f.write_str("operation not valid in the current transfer state"),
            #[cfg(feature = "std")]
            Error::Unavailable { path, source } => write!(f, "{}: {source}", path.display()),
            #[cfg(feature = "std")]
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            #[cfg(feature = "std")]
            Error::Unavailable { source, .. } => Some(source),
            #[cfg(feature = "std")]
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Malformed> for Error {
    fn from(value: Malformed) -> Self {
        Self::Malformed(value)
    }
}

#[cfg(feature = "std")]
impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

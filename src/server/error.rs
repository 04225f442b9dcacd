use std::{fmt, io};

use super::wire::DecodeError;

/// Faults that end a connection. Everything a single request can get wrong
/// is answered with a FATAL response instead.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// A frame header that could not be read, so there is no seq id to
    /// answer to.
    Decode(DecodeError),
    FrameTooLarge { len: usize, max: usize },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "transport error: {e}"),
            Error::Decode(e) => write!(f, "undecodable frame: {e}"),
            Error::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds the {max} byte limit")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::FrameTooLarge { .. } => None,
        }
    }
}

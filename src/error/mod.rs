use std::{error::Error, fmt};

/// Hard cap on a declared frame body. A length-prefixed stream cannot be
/// resynchronized after a corrupt header, so anything above this aborts
/// the connection instead of being skipped.
pub const MAX_FRAME_BODY: usize = 256 * 1024 * 1024;

#[derive(Debug)]
pub enum ProtocolError {
    /// The peer declared a body size above [`MAX_FRAME_BODY`].
    OversizeFrame { kind: u32, size: usize },
    /// A fixed-layout payload had the wrong length.
    BadPayload {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A bincode-framed asset failed to decode.
    BadAsset {
        what: &'static str,
        source: bincode::Error,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::OversizeFrame { kind, size } => {
                write!(
                    f,
                    "frame body of {size} bytes (kind {kind}) exceeds the {MAX_FRAME_BODY} byte cap"
                )
            }
            ProtocolError::BadPayload {
                what,
                expected,
                got,
            } => {
                write!(f, "{what} payload is {got} bytes, expected {expected}")
            }
            ProtocolError::BadAsset { what, source } => {
                write!(f, "cannot decode {what}: {source}")
            }
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProtocolError::BadAsset { source, .. } => Some(source),
            _ => None,
        }
    }
}

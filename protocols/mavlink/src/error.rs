use core::fmt;

/// Errors surfaced by the codec.
///
/// The parser itself never errors: bytes that do not form a valid frame are
/// discarded and scanning resumes, which is the required treatment of a
/// hostile or noisy byte stream. Errors only arise when building outgoing
/// frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message id is not in the definition table, so no CRC-extra is
    /// available and the frame cannot be finalised.
    UnknownMessage(u32),
    /// A typed payload did not fit the message's wire layout.
    PayloadLength { msgid: u32, len: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownMessage(id) => write!(f, "Unknown MAVLink msg ID {id}"),
            Error::PayloadLength { msgid, len } => {
                write!(f, "Bad payload length {len} for msg ID {msgid}")
            }
        }
    }
}

impl std::error::Error for Error {}

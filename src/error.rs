use thiserror::Error;

/// Errors while decoding a datagram into a segment. These are never fatal: the receive loops
///  log and discard the offending datagram and keep listening.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum FramingError {
    #[error("datagram of {len} bytes is shorter than the {header_len}-byte segment header")]
    Truncated { len: usize, header_len: usize },

    #[error("unrecognized segment kind tag {0:#04x}")]
    UnknownKind(u8),
}

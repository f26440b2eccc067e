use thiserror::Error;

/// Errors surfaced while decoding or encoding the post-decryption wire
/// format. Never panics the caller — §7 requires all decoding to be
/// bounds-checked and recoverable by dropping the datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unknown core subtype byte {0:#04x}")]
    UnknownCoreSubtype(u8),
    #[error("grouped sub-packet length {0} exceeds remaining datagram")]
    GroupedOverrun(usize),
    #[error("sized transfer total-length mismatch: stream started at {started}, saw {seen}")]
    SizedLengthMismatch { started: u32, seen: u32 },
    #[error("payload exceeds MTU-safe datagram size ({0} > {1})")]
    TooLarge(usize, usize),
}

/// Errors from the reliable send/receive state machine.
#[derive(Debug, Error)]
pub enum ReliableError {
    #[error("reorder buffer full (capacity {0})")]
    ReorderBufferFull(usize),
    #[error("retry limit ({0}) exceeded for seqnum {1}")]
    RetryLimitExceeded(u32, u32),
    #[error("bandwidth window exhausted, connection should be dropped")]
    WindowExhausted,
}

/// Errors from the raw UDP / connection-init layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no init handler accepted the connection datagram")]
    Unhandled,
    #[error(transparent)]
    Packet(#[from] PacketError),
}

//! Error types for the protocol engine, split by layer: construction and
//! framing faults, transport faults, and session-level negative outcomes.

use crate::diag::Diag;
use crate::fpdu::FpduType;
use crate::param::{Pgi, Pi};

/// Encoding, construction and framing errors. These are caller bugs or
/// malformed peer input; they are never retried.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("parameter {pi:?}: value of {len} bytes exceeds the wire maximum")]
    ValueTooLarge { pi: Pi, len: usize },

    #[error("group {pgi:?}: member content of {len} bytes does not fit one length byte")]
    GroupTooLarge { pgi: Pgi, len: usize },

    #[error("unknown parameter id {0}")]
    UnknownParameter(u8),

    #[error("parameter {pi:?} is not a member of group {pgi:?}")]
    InvalidGroupMember { pgi: Pgi, pi: Pi },

    #[error("truncated frame: {needed} more bytes declared than present")]
    TruncatedFrame { needed: usize },

    #[error("malformed frame: declared length {declared}, buffer holds {actual}")]
    MalformedFrame { declared: usize, actual: usize },

    #[error("unknown FPDU phase 0x{phase:02X} type 0x{ty:02X}")]
    UnknownFpdu { phase: u8, ty: u8 },

    #[error("{fpdu:?} is missing mandatory parameter id {param}")]
    MissingMandatory { fpdu: FpduType, param: u8 },

    #[error("frame of {0} bytes exceeds the 2-byte length field")]
    FrameTooLarge(usize),
}

/// Transport faults. All connection-fatal; the caller's retry policy
/// distinguishes a timeout from a peer close from a reset.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("receive timed out")]
    Timeout,

    #[error("peer closed the connection")]
    Closed,

    #[error("connection reset")]
    Reset,

    #[error("payload of {0} bytes exceeds the transport frame limit")]
    FrameTooLarge(usize),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session-level outcomes on the initiating side. A negative acknowledgment
/// is an ordinary error value carrying the wire diagnostic; a resumable
/// interrupt is its own variant so callers can drive a restart.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote rejected {context:?}: {diag}")]
    Rejected {
        context: FpduType,
        diag: Diag,
        text: Option<String>,
    },

    #[error("unexpected {got:?} in answer to {sent:?} (expected {expected:?})")]
    UnexpectedAck {
        sent: FpduType,
        expected: FpduType,
        got: FpduType,
    },

    #[error("received entity contained no frame")]
    EmptyEntity,

    #[error(
        "transfer interrupted at sync point {sync_point} after {bytes_transferred} bytes, resumable"
    )]
    Restart {
        sync_point: u32,
        restart_point: u64,
        bytes_transferred: u64,
    },
}

/// Server engine faults: everything the per-connection loop cannot recover
/// from by sending a diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("storage failure: {0}")]
    Store(#[from] std::io::Error),
}

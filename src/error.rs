//! Protocol error codes.
//!
//! The native protocol carries errors as stable numeric codes. The same
//! codes double as the client-visible `errno` value on the context, so the
//! enum implements `std::error::Error` directly rather than being wrapped
//! in a richer error type.

use thiserror::Error;

/// A native-protocol error code.
///
/// Discriminants are wire values and must never be renumbered.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    /// No error.
    #[error("ok")]
    Ok = 0,
    #[error("access denied")]
    Access = 1,
    #[error("unknown command")]
    Command = 2,
    #[error("invalid argument")]
    Invalid = 3,
    #[error("entity exists")]
    Exist = 4,
    #[error("no such entity")]
    NoEntity = 5,
    #[error("connection refused")]
    ConnectionRefused = 6,
    #[error("protocol error")]
    Protocol = 7,
    #[error("timeout")]
    Timeout = 8,
    #[error("no authentication key")]
    AuthKey = 9,
    #[error("internal error")]
    Internal = 10,
    #[error("connection terminated")]
    ConnectionTerminated = 11,
    #[error("entity killed")]
    Killed = 12,
    #[error("invalid server")]
    InvalidServer = 13,
    #[error("module initialization failed")]
    ModInitFailed = 14,
    #[error("bad state")]
    BadState = 15,
    #[error("no data")]
    NoData = 16,
    #[error("incompatible protocol version")]
    Version = 17,
    #[error("too large")]
    TooLarge = 18,
    #[error("not supported")]
    NotSupported = 19,
    #[error("unknown error code")]
    Unknown = 20,
    #[error("no such extension")]
    NoExtension = 21,
    #[error("obsolete functionality")]
    Obsolete = 22,
    #[error("missing implementation")]
    NotImplemented = 23,
    #[error("client forked")]
    Forked = 24,
    #[error("input/output error")]
    Io = 25,
    #[error("device or resource busy")]
    Busy = 26,
}

/// One past the largest valid code. Inbound codes at or above this are
/// normalized to [`ErrorCode::Unknown`].
pub const ERR_MAX: u32 = 27;

impl ErrorCode {
    /// Map a raw wire value onto a code, without normalization.
    pub fn from_wire(v: u32) -> Option<ErrorCode> {
        use ErrorCode::*;
        Some(match v {
            0 => Ok,
            1 => Access,
            2 => Command,
            3 => Invalid,
            4 => Exist,
            5 => NoEntity,
            6 => ConnectionRefused,
            7 => Protocol,
            8 => Timeout,
            9 => AuthKey,
            10 => Internal,
            11 => ConnectionTerminated,
            12 => Killed,
            13 => InvalidServer,
            14 => ModInitFailed,
            15 => BadState,
            16 => NoData,
            17 => Version,
            18 => TooLarge,
            19 => NotSupported,
            20 => Unknown,
            21 => NoExtension,
            22 => Obsolete,
            23 => NotImplemented,
            24 => Forked,
            25 => Io,
            26 => Busy,
            _ => return None,
        })
    }

    /// Normalize an inbound `ERROR` payload: the peer may never report
    /// success through the error path, and codes we do not know collapse
    /// to [`ErrorCode::Unknown`].
    pub fn normalize_wire(v: u32) -> ErrorCode {
        match ErrorCode::from_wire(v) {
            Some(ErrorCode::Ok) => ErrorCode::Protocol,
            Some(code) => code,
            None => ErrorCode::Unknown,
        }
    }

    /// The wire representation of this code.
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Crate-wide result alias carrying a protocol error code.
pub type Result<T> = std::result::Result<T, ErrorCode>;

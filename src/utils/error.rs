//! Error type shared by every pitrcoord operation.

use std::error;
use std::fmt;
use std::io;
use std::num;

use crate::compress::{CompressionType, CorruptInput};

/// Category of an error. Callers branch on this to pick a remediation, e.g.,
/// a converge timeout is retryable while an integrity violation is not.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Record does not exist (yet).
    NotFound,

    /// Missing chunks, timeline gaps, missing storage objects.
    Integrity,

    /// Stale heartbeat or lost participant.
    Liveness,

    /// Leader gave up waiting for shards.
    Timeout,

    /// Decompressor of the given codec rejected its input.
    CorruptInput(CompressionType),

    /// Undecodable oplog content.
    Decode,

    /// Applying an oplog entry to the node failed.
    Apply,

    /// Some shard reported the error status.
    ShardFailed,

    Other,
}

/// Customized error type for pitrcoord.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PitrError {
    kind: ErrorKind,
    msg: String,
}

impl PitrError {
    pub fn msg(msg: impl ToString) -> Self {
        PitrError {
            kind: ErrorKind::Other,
            msg: msg.to_string(),
        }
    }

    pub fn new(kind: ErrorKind, msg: impl ToString) -> Self {
        PitrError {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn not_found(msg: impl ToString) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Prefixes the message with the operation it happened in, keeping the
    /// error kind intact.
    pub fn wrap(self, ctx: impl fmt::Display) -> Self {
        PitrError {
            kind: self.kind,
            msg: format!("{}: {}", ctx, self.msg),
        }
    }
}

impl fmt::Display for PitrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for PitrError {}

/// Context wrapping on `Result`s, the `?`-friendly form of `PitrError::wrap`.
pub trait ResultExt<T> {
    fn wrap_err(self, ctx: impl fmt::Display) -> Result<T, PitrError>;

    fn wrap_err_with<C, F>(self, f: F) -> Result<T, PitrError>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<PitrError>,
{
    fn wrap_err(self, ctx: impl fmt::Display) -> Result<T, PitrError> {
        self.map_err(|e| e.into().wrap(ctx))
    }

    fn wrap_err_with<C, F>(self, f: F) -> Result<T, PitrError>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().wrap(f()))
    }
}

impl From<io::Error> for PitrError {
    fn from(e: io::Error) -> Self {
        // decompressors tag corrupt input inside the io error they return
        let codec = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CorruptInput>())
            .map(|c| c.codec());
        match codec {
            Some(codec) => {
                PitrError::new(ErrorKind::CorruptInput(codec), e.to_string())
            }
            None => PitrError::msg(e.to_string()),
        }
    }
}

// `From` impls for foreign errors that only need their message kept, under
// `Other` unless a kind is given.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl_from_error!($error => Other);
    };
    ($error:ty => $kind:ident) => {
        impl From<$error> for PitrError {
            fn from(e: $error) -> Self {
                PitrError::new(ErrorKind::$kind, e.to_string())
            }
        }
    };
}

// Same, for error types generic over a payload.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for PitrError {
            fn from(e: $error) -> PitrError {
                PitrError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(num::ParseIntError => Decode);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error => Decode);
impl_from_error!(serde_json::Error => Decode);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn plain_message_is_other() {
        let e = PitrError::msg("restore cancelled");
        assert_eq!(e.to_string(), "restore cancelled");
        assert_eq!(e.kind(), ErrorKind::Other);
        let e: PitrError = "6.x".parse::<u32>().unwrap_err().into();
        assert!(e.is(ErrorKind::Decode));
    }

    #[test]
    fn wrap_keeps_kind() {
        let e = PitrError::new(ErrorKind::Integrity, "gap at 10.0")
            .wrap("check chunks")
            .wrap("restore rs0");
        assert_eq!(e.to_string(), "restore rs0: check chunks: gap at 10.0");
        assert!(e.is(ErrorKind::Integrity));
    }

    #[test]
    fn wrap_err_on_result() {
        let r: Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "no such key"));
        let e = r.wrap_err("open object").unwrap_err();
        assert!(e.to_string().starts_with("open object: "));
        assert!(e.to_string().contains("no such key"));
    }

    #[test]
    fn from_corrupt_io_error() {
        let io_error = io::Error::new(
            io::ErrorKind::InvalidData,
            CorruptInput::new(CompressionType::Snappy, "bad frame"),
        );
        let e = PitrError::from(io_error);
        assert_eq!(e.kind(), ErrorKind::CorruptInput(CompressionType::Snappy));
    }
}

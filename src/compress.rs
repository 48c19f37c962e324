//! Decompression of stored oplog chunk objects.

use std::error;
use std::fmt;
use std::io::{self, Read};

use crate::utils::PitrError;

use serde::{Deserialize, Serialize};

/// Compression codec tag recorded with each stored object.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Pgzip,
    Snappy,
    S2,
    Lz4,
    Zstd,
}

impl CompressionType {
    /// File name suffix of objects written with this codec.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip | Self::Pgzip => ".gz",
            Self::Snappy => ".snappy",
            Self::S2 => ".s2",
            Self::Lz4 => ".lz4",
            Self::Zstd => ".zst",
        }
    }

    /// Codec to retry with when this one reports corrupt input. Older
    /// writers produced S2 content under the `.snappy` name, so a snappy
    /// failure gets exactly one more attempt as S2 and nothing else does.
    pub fn mislabel_fallback(&self) -> Option<CompressionType> {
        match self {
            Self::Snappy => Some(Self::S2),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Pgzip => "pgzip",
            Self::Snappy => "snappy",
            Self::S2 => "s2",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        write!(f, "{}", name)
    }
}

/// Marker carried inside an `io::Error` when a decoder rejects its input.
/// Converts into `ErrorKind::CorruptInput(codec)` on the way to `PitrError`.
#[derive(Debug, Clone)]
pub struct CorruptInput {
    codec: CompressionType,
    detail: String,
}

impl CorruptInput {
    pub fn new(codec: CompressionType, detail: impl ToString) -> Self {
        CorruptInput {
            codec,
            detail: detail.to_string(),
        }
    }

    #[inline]
    pub fn codec(&self) -> CompressionType {
        self.codec
    }

    /// Wraps into an `io::Error` so it can travel through `Read` impls.
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

impl fmt::Display for CorruptInput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: corrupt input: {}", self.codec, self.detail)
    }
}

impl error::Error for CorruptInput {}

/// Decompression service. Implementations must report undecodable content
/// as an `io::Error` carrying `CorruptInput`, either from `decompress` itself
/// or lazily from the returned reader.
pub trait Decompressor: Send + Sync {
    fn decompress(
        &self,
        src: Box<dyn Read + Send>,
        codec: CompressionType,
    ) -> Result<Box<dyn Read + Send>, PitrError>;
}

/// Error raised by the storage stream under a decoder, as opposed to one
/// the decoder raised about the content.
#[derive(Debug)]
struct SourceFailure(io::Error);

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for SourceFailure {}

/// Marks every error of the storage stream as a `SourceFailure`, so that
/// `CorruptTagged` can tell them apart once a decoder forwarded them.
struct SourceMarked<R> {
    inner: R,
}

impl<R: Read> Read for SourceMarked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::new(e.kind(), SourceFailure(e)))
    }
}

/// Reader adapter over a decoder fed by `SourceMarked`. Decoding failures
/// get tagged as corrupt input of the codec; storage errors come out as
/// they were raised.
struct CorruptTagged<R> {
    inner: R,
    codec: CompressionType,
}

impl<R: Read> Read for CorruptTagged<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            let from_source = e
                .get_ref()
                .map_or(false, |inner| inner.is::<SourceFailure>());
            if from_source {
                let kind = e.kind();
                let failure = e
                    .into_inner()
                    .and_then(|inner| inner.downcast::<SourceFailure>().ok());
                return match failure {
                    Some(failure) => failure.0,
                    None => io::Error::new(kind, "storage stream failed"),
                };
            }
            let already_tagged = e
                .get_ref()
                .map_or(false, |inner| inner.is::<CorruptInput>());
            if already_tagged || e.kind() == io::ErrorKind::Interrupted {
                e
            } else {
                CorruptInput::new(self.codec, e).into_io()
            }
        })
    }
}

/// Built-in decompressor covering the codecs available in-process. Snappy,
/// S2 and LZ4 objects need an injected `Decompressor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codecs;

impl Decompressor for Codecs {
    fn decompress(
        &self,
        src: Box<dyn Read + Send>,
        codec: CompressionType,
    ) -> Result<Box<dyn Read + Send>, PitrError> {
        let src = SourceMarked { inner: src };
        let decoded: Box<dyn Read + Send> = match codec {
            CompressionType::None => return Ok(src.inner),
            CompressionType::Gzip => {
                Box::new(flate2::read::GzDecoder::new(src))
            }
            CompressionType::Pgzip => {
                Box::new(flate2::read::MultiGzDecoder::new(src))
            }
            CompressionType::Zstd => Box::new(
                zstd::stream::read::Decoder::new(src)
                    .map_err(|e| CorruptInput::new(codec, e).into_io())?,
            ),
            CompressionType::Snappy
            | CompressionType::S2
            | CompressionType::Lz4 => {
                return Err(PitrError::msg(format!(
                    "codec {} is not built in",
                    codec
                )));
            }
        };

        Ok(Box::new(CorruptTagged {
            inner: decoded,
            codec,
        }))
    }
}

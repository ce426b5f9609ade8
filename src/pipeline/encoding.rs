//! Content-Encoding decoding for bodies that get rewritten.

use std::io::{self, Read};

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Other(String),
}

impl ContentEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => ContentEncoding::Identity,
            Some("gzip") | Some("x-gzip") => ContentEncoding::Gzip,
            Some("deflate") => ContentEncoding::Deflate,
            Some("br") => ContentEncoding::Brotli,
            Some(other) => ContentEncoding::Other(other.to_string()),
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == ContentEncoding::Identity
    }
}

/// Decode `body`, refusing to produce more than `limit` bytes.
pub fn decode(body: Bytes, encoding: &ContentEncoding, limit: usize) -> io::Result<Bytes> {
    match encoding {
        ContentEncoding::Identity => Ok(body),
        ContentEncoding::Gzip => read_limited(GzDecoder::new(&body[..]), limit),
        ContentEncoding::Deflate => {
            // "deflate" is zlib-wrapped by the RFC but raw in the wild.
            read_limited(ZlibDecoder::new(&body[..]), limit)
                .or_else(|_| read_limited(DeflateDecoder::new(&body[..]), limit))
        }
        ContentEncoding::Brotli => read_limited(brotli::Decompressor::new(&body[..], 4096), limit),
        ContentEncoding::Other(name) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported content encoding: {name}"),
        )),
    }
}

fn read_limited(reader: impl Read, limit: usize) -> io::Result<Bytes> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "decoded body exceeds the size limit"));
    }
    Ok(Bytes::from(out))
}

//! Destination response: one struct for every source.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::cache::CacheHit;
use crate::transport::error::TransportError;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Http1,
    Http2,
    File,
    Mock,
    Cache,
    SpecialPage,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Http1 => "http1",
            ResponseSource::Http2 => "http2",
            ResponseSource::File => "file",
            ResponseSource::Mock => "mock",
            ResponseSource::Cache => "cache",
            ResponseSource::SpecialPage => "special_page",
        }
    }
}

pub enum ResponseBody {
    Incoming(Incoming),
    File(tokio::fs::File),
    Buffered(Bytes),
}

impl ResponseBody {
    /// Read the whole body, failing past `limit` bytes. Returns trailers
    /// when the transport delivered any.
    pub async fn collect(self, limit: usize) -> Result<(Bytes, Option<HeaderMap>), TransportError> {
        match self {
            ResponseBody::Incoming(incoming) => {
                let collected = Limited::new(incoming, limit).collect().await.map_err(|err| {
                    if err.is::<http_body_util::LengthLimitError>() {
                        TransportError::BodyTooLarge { limit }
                    } else {
                        match err.downcast::<hyper::Error>() {
                            Ok(err) => TransportError::from_hyper(*err),
                            Err(err) => TransportError::Request(err.to_string()),
                        }
                    }
                })?;
                let trailers = collected.trailers().cloned();
                Ok((collected.to_bytes(), trailers))
            }
            ResponseBody::File(file) => {
                let mut buf = Vec::new();
                file.take(limit as u64 + 1)
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|err| TransportError::File {
                        path: String::new(),
                        reason: err.to_string(),
                    })?;
                if buf.len() > limit {
                    return Err(TransportError::BodyTooLarge { limit });
                }
                Ok((Bytes::from(buf), None))
            }
            ResponseBody::Buffered(bytes) if bytes.len() > limit => Err(TransportError::BodyTooLarge { limit }),
            ResponseBody::Buffered(bytes) => Ok((bytes, None)),
        }
    }

    /// Stream the body as-is.
    pub fn into_body(self) -> Body {
        match self {
            ResponseBody::Incoming(incoming) => Body::new(incoming),
            ResponseBody::File(file) => Body::from_stream(ReaderStream::new(file)),
            ResponseBody::Buffered(bytes) => Body::from(bytes),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Incoming(_) => f.write_str("ResponseBody::Incoming"),
            ResponseBody::File(_) => f.write_str("ResponseBody::File"),
            ResponseBody::Buffered(bytes) => write!(f, "ResponseBody::Buffered({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug)]
pub struct DestinationResponse {
    pub source: ResponseSource,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub trailers: Option<HeaderMap>,
    pub body: ResponseBody,
    /// Present on `101 Switching Protocols`; resolves to the upgraded
    /// destination stream, including any bytes read past the head.
    pub upgrade: Option<OnUpgrade>,
}

impl DestinationResponse {
    pub fn buffered(source: ResponseSource, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            source,
            status,
            headers,
            trailers: None,
            body: ResponseBody::Buffered(body),
            upgrade: None,
        }
    }

    /// Empty HTML page answered for `about:blank` and `about:error`.
    pub fn special_page() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        Self::buffered(ResponseSource::SpecialPage, StatusCode::OK, headers, Bytes::new())
    }

    pub fn from_cache(hit: CacheHit) -> Self {
        let response = hit.response;
        Self {
            source: ResponseSource::Cache,
            status: response.status,
            headers: response.headers,
            trailers: response.trailers,
            body: ResponseBody::Buffered(response.body),
            upgrade: None,
        }
    }

    pub fn is_upgrade(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS && self.upgrade.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_body_respects_limit() {
        let body = ResponseBody::Buffered(Bytes::from_static(b"0123456789"));
        assert!(matches!(body.collect(4).await, Err(TransportError::BodyTooLarge { limit: 4 })));

        let body = ResponseBody::Buffered(Bytes::from_static(b"0123"));
        let (bytes, trailers) = body.collect(4).await.unwrap();
        assert_eq!(&bytes[..], b"0123");
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn file_body_is_read_fully() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"hello").unwrap();
        let handle = tokio::fs::File::open(file.path()).await.unwrap();

        let (bytes, _) = ResponseBody::File(handle).collect(1024).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[test]
    fn special_page_is_empty_html() {
        let page = DestinationResponse::special_page();
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.headers[header::CONTENT_TYPE], "text/html");
        assert_eq!(page.source, ResponseSource::SpecialPage);
    }
}

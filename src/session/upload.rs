//! Multipart upload rewriting interface.

use bytes::Bytes;

/// Rewrites `multipart/form-data` bodies before they leave the proxy.
///
/// The client sandbox replaces file inputs with placeholders; the rewriter
/// substitutes the real file content on the way out.
pub trait UploadRewriter: Send + Sync {
    fn rewrite(&self, content_type: &str, body: Bytes) -> Bytes;
}

/// Whether a request content type carries a multipart upload.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case("multipart/form-data"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_multipart_bodies() {
        assert!(is_multipart("multipart/form-data; boundary=xyz"));
        assert!(is_multipart("Multipart/Form-Data"));
        assert!(!is_multipart("application/x-www-form-urlencoded"));
    }
}

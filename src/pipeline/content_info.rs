//! Classification of a destination response.

use axum::http::{header, HeaderMap, Method, StatusCode};

use crate::pipeline::charset::Charset;
use crate::pipeline::context::{DestInfo, RequestFlags};
use crate::pipeline::encoding::ContentEncoding;

const PAGE_MIMES: [&str; 3] = ["text/html", "application/xhtml+xml", "application/xml"];
const SCRIPT_MIMES: [&str; 5] = [
    "application/javascript",
    "text/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "text/ecmascript",
];
const MANIFEST_MIME: &str = "text/cache-manifest";

/// What the pipeline learned about a response before reading its body.
#[derive(Debug, Clone)]
pub struct ContentInfo {
    /// Lower-cased MIME type without parameters; empty when absent.
    pub mime: String,
    pub is_page: bool,
    pub is_iframe: bool,
    pub is_css: bool,
    pub is_script: bool,
    pub is_manifest: bool,
    pub is_json: bool,
    pub is_redirect: bool,
    pub is_not_modified: bool,
    pub is_attachment: bool,
    pub is_no_content: bool,
    pub requires_processing: bool,
    pub charset: Charset,
    pub encoding: ContentEncoding,
}

impl ContentInfo {
    pub fn compute(
        method: &Method,
        flags: &RequestFlags,
        dest: &DestInfo,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Self {
        let content_type = header_str(headers, header::CONTENT_TYPE);
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let is_html = mime.is_empty() || PAGE_MIMES.contains(&mime.as_str());
        let is_page = (flags.is_page && is_html) || flags.is_html_import;
        let is_iframe = flags.is_iframe && is_html;
        let is_css = mime.contains("text/css");
        let is_script = dest.resource_type.is_script() || SCRIPT_MIMES.contains(&mime.as_str());
        let is_manifest = mime == MANIFEST_MIME;
        let is_json = mime.contains("json");

        let is_redirect = status.is_redirection()
            && status != StatusCode::NOT_MODIFIED
            && headers.contains_key(header::LOCATION);
        let is_not_modified = status == StatusCode::NOT_MODIFIED;
        let is_no_content = status == StatusCode::NO_CONTENT;
        let is_attachment = header_str(headers, header::CONTENT_DISPOSITION)
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("attachment");

        let is_asset = is_css || is_script || is_manifest;
        let requires_processing = *method != Method::HEAD
            && !flags.is_ajax
            && !is_redirect
            && !is_not_modified
            && !is_no_content
            && !is_attachment
            && (is_page || is_iframe || is_asset);

        let mut charset = Charset::fallback(is_page || is_iframe);
        charset.from_content_type(content_type);
        charset.from_url(dest.charset.as_deref());

        Self {
            encoding: ContentEncoding::from_header(headers.get(header::CONTENT_ENCODING).and_then(|v| v.to_str().ok())),
            mime,
            is_page,
            is_iframe,
            is_css,
            is_script,
            is_manifest,
            is_json,
            is_redirect,
            is_not_modified,
            is_attachment,
            is_no_content,
            requires_processing,
            charset,
        }
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

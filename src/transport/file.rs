//! Local file destinations, including files packed in `.asar` archives.

use std::io;
use std::path::{Path, PathBuf};

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use url::Url;

use crate::transport::error::TransportError;
use crate::transport::response::{DestinationResponse, ResponseBody, ResponseSource};

const ASAR_EXTENSION: &str = ".asar";

/// Fetch a `file:` URL. Archive entries larger than `max_body_size` are
/// rejected before they are read.
pub async fn fetch(url: &Url, max_body_size: usize) -> Result<DestinationResponse, TransportError> {
    let path = file_path(url);
    let file_error = |reason: String| TransportError::File {
        path: path.display().to_string(),
        reason,
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => Err(file_error("is a directory".into())),
        Ok(meta) => {
            let file = tokio::fs::File::open(&path).await.map_err(|e| file_error(e.to_string()))?;
            let mut headers = content_headers(&path);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
            Ok(DestinationResponse {
                source: ResponseSource::File,
                status: StatusCode::OK,
                headers,
                trailers: None,
                body: ResponseBody::File(file),
                upgrade: None,
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => match read_from_archive(&path, max_body_size).await {
            Some(Ok(body)) => {
                let mut headers = content_headers(&path);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                Ok(DestinationResponse::buffered(ResponseSource::File, StatusCode::OK, headers, body))
            }
            Some(Err(err)) => Err(file_error(err.to_string())),
            None => Err(file_error(err.to_string())),
        },
        Err(err) => Err(file_error(err.to_string())),
    }
}

/// Filesystem path of a `file:` URL. `/C:/dir` becomes `C:/dir`.
pub fn file_path(url: &Url) -> PathBuf {
    let decoded = percent_decode_str(url.path()).decode_utf8_lossy();
    let bytes = decoded.as_bytes();
    let has_drive = bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':';
    if has_drive {
        PathBuf::from(&decoded[1..])
    } else {
        PathBuf::from(decoded.as_ref())
    }
}

fn content_headers(path: &Path) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime_type(path)));
    headers
}

pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "appcache" | "manifest" => "text/cache-manifest",
        _ => "application/octet-stream",
    }
}

/// Look for `path` inside a containing archive. `None` when no ancestor
/// is an archive or the archive has no such entry.
async fn read_from_archive(path: &Path, max_body_size: usize) -> Option<io::Result<Bytes>> {
    for archive in path.ancestors().skip(1) {
        let is_archive = archive
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(ASAR_EXTENSION))
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        let Ok(meta) = tokio::fs::metadata(archive).await else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(archive) else { continue };
        return read_archive_entry(archive, relative, max_body_size).await.transpose();
    }
    None
}

async fn read_archive_entry(archive: &Path, relative: &Path, max_body_size: usize) -> io::Result<Option<Bytes>> {
    let mut file = tokio::fs::File::open(archive).await?;
    let archive_len = file.metadata().await?.len();

    // Pickle-framed JSON header: [4][header_size][payload_size][json_len][json].
    let mut prefix = [0u8; 16];
    file.read_exact(&mut prefix).await?;
    let header_size = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as u64;
    let json_len = u32::from_le_bytes([prefix[12], prefix[13], prefix[14], prefix[15]]) as usize;
    if json_len as u64 > header_size || header_size > archive_len {
        return Err(corrupt("corrupt archive header"));
    }
    let mut json = vec![0u8; json_len];
    file.read_exact(&mut json).await?;
    let header: Value = serde_json::from_slice(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let Some(entry) = find_entry(&header, relative) else {
        return Ok(None);
    };

    if entry.get("unpacked").and_then(Value::as_bool).unwrap_or(false) {
        let mut unpacked = archive.as_os_str().to_owned();
        unpacked.push(".unpacked");
        let unpacked = PathBuf::from(unpacked).join(relative);
        if tokio::fs::metadata(&unpacked).await?.len() > max_body_size as u64 {
            return Err(too_large());
        }
        let body = tokio::fs::read(unpacked).await?;
        return Ok(Some(Bytes::from(body)));
    }

    let size = entry.get("size").and_then(Value::as_u64).unwrap_or(0);
    let offset = entry
        .get("offset")
        .and_then(|o| o.as_str().and_then(|s| s.parse().ok()).or_else(|| o.as_u64()))
        .unwrap_or(0);

    if size > max_body_size as u64 {
        return Err(too_large());
    }
    let start = (8 + header_size)
        .checked_add(offset)
        .filter(|start| start.checked_add(size).is_some_and(|end| end <= archive_len))
        .ok_or_else(|| corrupt("archive entry out of bounds"))?;

    file.seek(SeekFrom::Start(start)).await?;
    let mut body = vec![0u8; size as usize];
    file.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

fn corrupt(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

fn too_large() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "archive entry exceeds the body size limit")
}

fn find_entry<'a>(header: &'a Value, relative: &Path) -> Option<&'a Value> {
    let mut node = header;
    for component in relative.components() {
        let name = component.as_os_str().to_str()?;
        node = node.get("files")?.get(name)?;
    }
    // Directories carry "files"; only leaf entries are readable.
    if node.get("files").is_some() {
        None
    } else {
        Some(node)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIMIT: usize = 1024;

    #[test]
    fn strips_slash_before_drive_letter() {
        let url = Url::parse("file:///C:/dir/index.html").unwrap();
        assert_eq!(file_path(&url), PathBuf::from("C:/dir/index.html"));

        let url = Url::parse("file:///home/user/a%20b.html").unwrap();
        assert_eq!(file_path(&url), PathBuf::from("/home/user/a b.html"));
    }

    #[test]
    fn mime_types() {
        assert_eq!(mime_type(Path::new("a.HTML")), "text/html");
        assert_eq!(mime_type(Path::new("a.js")), "application/javascript");
        assert_eq!(mime_type(Path::new("a")), "application/octet-stream");
    }

    #[tokio::test]
    async fn serves_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<p>hi</p>").unwrap();

        let res = fetch(&Url::from_file_path(&path).unwrap(), LIMIT).await.unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.headers[header::CONTENT_TYPE], "text/html");
        let (body, _) = res.body.collect(1024).await.unwrap();
        assert_eq!(&body[..], b"<p>hi</p>");
    }

    #[tokio::test]
    async fn serves_files_from_archives() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.asar");
        test_support::write_archive(&archive, &[("a.txt", b"first"), ("b.js", b"var b;")]);

        let url = Url::from_file_path(archive.join("b.js")).unwrap();
        let res = fetch(&url, LIMIT).await.unwrap();
        assert_eq!(res.headers[header::CONTENT_TYPE], "application/javascript");
        let (body, _) = res.body.collect(1024).await.unwrap();
        assert_eq!(&body[..], b"var b;");
    }

    #[tokio::test]
    async fn missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("nope.html")).unwrap();
        assert!(matches!(fetch(&url, LIMIT).await, Err(TransportError::File { .. })));

        let archive = dir.path().join("app.asar");
        test_support::write_archive(&archive, &[("a.txt", b"first")]);
        let url = Url::from_file_path(archive.join("missing.txt")).unwrap();
        assert!(matches!(fetch(&url, LIMIT).await, Err(TransportError::File { .. })));
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path()).unwrap();
        assert!(fetch(&url, LIMIT).await.is_err());
    }

    #[tokio::test]
    async fn archive_entries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.asar");
        let header = json!({ "files": {
            "huge.bin": { "size": u64::MAX, "offset": "0" },
            "past-end.txt": { "size": 4, "offset": "100" },
            "wrapping.txt": { "size": 1, "offset": u64::MAX.to_string() },
            "ok.txt": { "size": 2, "offset": "0" },
        }});
        test_support::write_raw_archive(&archive, &header, b"ok");

        for name in ["huge.bin", "past-end.txt", "wrapping.txt"] {
            let url = Url::from_file_path(archive.join(name)).unwrap();
            assert!(matches!(fetch(&url, LIMIT).await, Err(TransportError::File { .. })), "{name}");
        }

        let url = Url::from_file_path(archive.join("ok.txt")).unwrap();
        let (body, _) = fetch(&url, LIMIT).await.unwrap().body.collect(LIMIT).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn archive_entries_over_the_body_limit_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.asar");
        test_support::write_archive(&archive, &[("big.txt", &[b'x'; 64])]);

        let url = Url::from_file_path(archive.join("big.txt")).unwrap();
        assert!(fetch(&url, 16).await.is_err());
        assert!(fetch(&url, 64).await.is_ok());
    }
}

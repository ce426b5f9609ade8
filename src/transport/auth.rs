//! Destination authentication: Basic and NTLM (NTLMv2 responses).
//!
//! # Design Decisions
//! - Credentials are answered once per logical request; see `retry::RetryPlan`
//! - The NTLM negotiate/authenticate legs share one HTTP/1 connection,
//!   because NTLM authenticates the connection rather than the request

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{header, HeaderMap, HeaderValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

/// Credentials used to answer destination auth challenges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// NTLM domain.
    pub domain: Option<String>,
    /// NTLM workstation name.
    pub workstation: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: None,
            workstation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Ntlm,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "basic",
            AuthScheme::Ntlm => "ntlm",
        }
    }
}

/// Scheme offered by a 401 response. NTLM wins when both are offered.
pub fn challenge_scheme(headers: &HeaderMap) -> Option<AuthScheme> {
    let mut scheme = None;
    for value in headers.get_all(header::WWW_AUTHENTICATE) {
        let Ok(value) = value.to_str() else { continue };
        let lower = value.trim_start().to_ascii_lowercase();
        if lower.starts_with("ntlm") || lower.starts_with("negotiate") {
            return Some(AuthScheme::Ntlm);
        }
        if lower.starts_with("basic") {
            scheme = Some(AuthScheme::Basic);
        }
    }
    scheme
}

/// `Authorization: Basic base64(user:pass)`.
pub fn basic_authorization(credentials: &Credentials) -> HeaderValue {
    basic_header_value(&credentials.username, &credentials.password)
}

pub(crate) fn basic_header_value(username: &str, password: &str) -> HeaderValue {
    let token = BASE64.encode(format!("{username}:{password}"));
    HeaderValue::from_str(&format!("Basic {token}")).unwrap_or_else(|_| HeaderValue::from_static("Basic"))
}

/// Server challenge carried by an NTLM type 2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

/// NTLM type 1 (negotiate) message as an `Authorization` value.
pub fn ntlm_negotiate_header() -> HeaderValue {
    let mut message = Vec::with_capacity(32);
    message.extend_from_slice(NTLM_SIGNATURE);
    message.extend_from_slice(&1u32.to_le_bytes());
    message.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    // Empty domain and workstation security buffers.
    push_security_buffer(&mut message, 0, 32);
    push_security_buffer(&mut message, 0, 32);
    ntlm_header(&message)
}

/// Parse the type 2 message from a 401's `WWW-Authenticate` headers.
pub fn parse_ntlm_challenge(headers: &HeaderMap) -> Option<NtlmChallenge> {
    let token = headers
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            let scheme = scheme.to_ascii_lowercase();
            (scheme == "ntlm" || scheme == "negotiate").then(|| token.trim().to_string())
        })?;
    let message = BASE64.decode(token).ok()?;

    if message.len() < 32 || &message[..8] != NTLM_SIGNATURE || read_u32(&message, 8)? != 2 {
        return None;
    }
    let flags = read_u32(&message, 20)?;
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(message.get(24..32)?);

    let target_info = if message.len() >= 48 {
        let len = read_u16(&message, 40)? as usize;
        let offset = read_u32(&message, 44)? as usize;
        message.get(offset..offset + len)?.to_vec()
    } else {
        Vec::new()
    };

    Some(NtlmChallenge {
        flags,
        server_challenge,
        target_info,
    })
}

/// NTLM type 3 (authenticate) message with NTLMv2 responses.
pub fn ntlm_authenticate_header(credentials: &Credentials, challenge: &NtlmChallenge) -> HeaderValue {
    let client_nonce: [u8; 8] = std::array::from_fn(|_| fastrand::u8(..));
    ntlm_header(&authenticate_message(credentials, challenge, client_nonce, filetime_now()))
}

fn authenticate_message(
    credentials: &Credentials,
    challenge: &NtlmChallenge,
    client_nonce: [u8; 8],
    timestamp: u64,
) -> Vec<u8> {
    let domain = credentials.domain.as_deref().unwrap_or_default();
    let workstation = credentials.workstation.as_deref().unwrap_or_default();

    let nt_hash: [u8; 16] = Md4::digest(utf16le(&credentials.password)).into();
    let identity = utf16le(&format!("{}{}", credentials.username.to_uppercase(), domain));
    let v2_hash = hmac_md5(&nt_hash, &[&identity]);

    let mut blob = Vec::with_capacity(32 + challenge.target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(&client_nonce);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(&challenge.target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(&v2_hash, &[&challenge.server_challenge, &blob]);
    let mut nt_response = proof.to_vec();
    nt_response.extend_from_slice(&blob);

    let mut lm_response = hmac_md5(&v2_hash, &[&challenge.server_challenge, &client_nonce]).to_vec();
    lm_response.extend_from_slice(&client_nonce);

    let domain = utf16le(domain);
    let user = utf16le(&credentials.username);
    let workstation = utf16le(workstation);

    let payload: [&[u8]; 5] = [&lm_response, &nt_response, &domain, &user, &workstation];
    let mut message = Vec::with_capacity(64 + payload.iter().map(|p| p.len()).sum::<usize>());
    message.extend_from_slice(NTLM_SIGNATURE);
    message.extend_from_slice(&3u32.to_le_bytes());

    let mut offset = 64u32;
    for part in payload {
        push_security_buffer(&mut message, part.len() as u16, offset);
        offset += part.len() as u32;
    }
    // Empty session key.
    push_security_buffer(&mut message, 0, offset);
    message.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());

    for part in payload {
        message.extend_from_slice(part);
    }
    message
}

fn ntlm_header(message: &[u8]) -> HeaderValue {
    HeaderValue::from_str(&format!("NTLM {}", BASE64.encode(message))).unwrap_or_else(|_| HeaderValue::from_static("NTLM"))
}

fn push_security_buffer(message: &mut Vec<u8>, len: u16, offset: u32) {
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&offset.to_le_bytes());
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

/// Current time as a Windows FILETIME (100ns ticks since 1601).
fn filetime_now() -> u64 {
    let since_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_unix.as_secs() + FILETIME_EPOCH_OFFSET_SECS) * 10_000_000 + u64::from(since_unix.subsec_nanos() / 100)
}

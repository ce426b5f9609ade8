//! Same-origin policy check for ajax responses.
//!
//! The browser only sees the proxy origin, so it cannot enforce CORS for
//! the real destinations. The pipeline applies the check instead, using the
//! destination origin of the page that issued the request.

use axum::http::{header, HeaderMap};

use crate::pipeline::context::{CredentialsMode, PipelineContext};

/// Whether the response to `ctx`'s request may be exposed to the page.
pub fn check(ctx: &PipelineContext, response_headers: &HeaderMap) -> bool {
    let Some(initiator) = ctx.dest.initiator_origin() else {
        return true;
    };
    if initiator == ctx.dest.origin {
        return true;
    }

    let credentialed = ctx.flags.credentials == CredentialsMode::Include;
    allows(response_headers, initiator, credentialed)
}

fn allows(headers: &HeaderMap, initiator: &str, credentialed: bool) -> bool {
    let allow_origin = headers
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    match allow_origin {
        None => false,
        Some("*") => !credentialed,
        Some(origin) => {
            if !origin.eq_ignore_ascii_case(initiator) {
                return false;
            }
            !credentialed
                || headers
                    .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.trim() == "true")
        }
    }
}

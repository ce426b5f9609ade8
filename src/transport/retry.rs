//! Per-request retry state machine.
//!
//! Every logical destination request owns one `RetryPlan`. Each attempt's
//! outcome is fed to `next_step`, which decides whether to resend and why.
//! Each kind of retry is granted at most once.

use axum::http::{HeaderMap, StatusCode};

use crate::transport::auth::{challenge_scheme, AuthScheme};

/// What one attempt produced, as far as retrying is concerned.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    Response { status: StatusCode, headers: &'a HeaderMap },
    TlsNegotiationFailed,
    Http2StreamFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Credentials(AuthScheme),
    TlsDowngrade,
    Http1Fallback,
}

impl RetryReason {
    pub fn label(&self) -> &'static str {
        match self {
            RetryReason::Credentials(AuthScheme::Basic) => "credentials_basic",
            RetryReason::Credentials(AuthScheme::Ntlm) => "credentials_ntlm",
            RetryReason::TlsDowngrade => "tls_downgrade",
            RetryReason::Http1Fallback => "http1_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Resend(RetryReason),
    /// Hand the outcome to the caller as-is.
    Finish,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPlan {
    has_credentials: bool,
    credentials_sent: bool,
    tls_downgraded: bool,
    http2_fallback_used: bool,
}

impl RetryPlan {
    /// `already_legacy` is set when the host is known to need legacy TLS, so
    /// there is nothing left to downgrade to.
    pub fn new(has_credentials: bool, already_legacy: bool) -> Self {
        Self {
            has_credentials,
            tls_downgraded: already_legacy,
            ..Self::default()
        }
    }

    pub fn next_step(&mut self, outcome: AttemptOutcome<'_>) -> NextStep {
        match outcome {
            AttemptOutcome::Response { status, headers } => {
                if status != StatusCode::UNAUTHORIZED || !self.has_credentials || self.credentials_sent {
                    return NextStep::Finish;
                }
                match challenge_scheme(headers) {
                    Some(scheme) => {
                        self.credentials_sent = true;
                        NextStep::Resend(RetryReason::Credentials(scheme))
                    }
                    None => NextStep::Finish,
                }
            }
            AttemptOutcome::TlsNegotiationFailed if !self.tls_downgraded => {
                self.tls_downgraded = true;
                NextStep::Resend(RetryReason::TlsDowngrade)
            }
            AttemptOutcome::Http2StreamFailed if !self.http2_fallback_used => {
                self.http2_fallback_used = true;
                NextStep::Resend(RetryReason::Http1Fallback)
            }
            _ => NextStep::Finish,
        }
    }

    pub fn credentials_sent(&self) -> bool {
        self.credentials_sent
    }
}

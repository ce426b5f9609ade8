//! WebSocket relay.
//!
//! # Data Flow
//! ```text
//! Browser ←── raw bytes ──→ Proxy ←── raw bytes ──→ Destination
//! ```
//!
//! # Design Decisions
//! - The destination's `101` head is rewritten and sent to the browser;
//!   after that both sockets are spliced byte for byte (no frame parsing)
//! - EOF on one side shuts down the write half of the other
//! - Resets and broken pipes are the normal way sockets die mid-test; they
//!   are logged at debug level only

use std::io;

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

/// How socket errors on a relayed connection are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SocketErrorPolicy {
    #[default]
    Report,
    /// Connection resets are expected and not worth a warning.
    IgnoreResets,
}

impl SocketErrorPolicy {
    pub fn is_benign(&self, err: &io::Error) -> bool {
        match self {
            SocketErrorPolicy::Report => false,
            SocketErrorPolicy::IgnoreResets => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }
}

/// Splice the browser and destination connections once both upgrades
/// complete. Runs until either side closes.
pub fn spawn_relay(client: OnUpgrade, destination: OnUpgrade, policy: SocketErrorPolicy, url: String) {
    tokio::spawn(async move {
        let (client, destination) = match tokio::try_join!(client, destination) {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "WebSocket upgrade did not complete");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut destination = TokioIo::new(destination);
        match tokio::io::copy_bidirectional(&mut client, &mut destination).await {
            Ok((to_destination, to_client)) => {
                tracing::debug!(url = %url, to_destination, to_client, "WebSocket relay closed");
            }
            Err(err) if policy.is_benign(&err) => {
                tracing::debug!(url = %url, error = %err, "WebSocket peer reset the connection");
            }
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "WebSocket relay failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_resets_are_benign() {
        let policy = SocketErrorPolicy::IgnoreResets;
        assert!(policy.is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(policy.is_benign(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!policy.is_benign(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!SocketErrorPolicy::Report.is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}

//! Browser sessions and their external collaborators.
//!
//! # Responsibilities
//! - Hold per-session options (credentials, external proxy, timeouts)
//! - Carry the cookie jar, hook provider, upload rewriter and driver
//! - Keep the table of open sessions that dispatch consults
//!
//! # Design Decisions
//! - Collaborators are trait objects injected at session creation
//! - The registry is a `DashMap`; lookups never hold a lock across `.await`

pub mod cookies;
pub mod driver;
pub mod hooks;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::transport::{Credentials, ExternalProxy};

pub use cookies::{parse_client_sync_cookies, ClientCookieRecord, CookieJar, MemoryCookieJar, NoCookieJar};
pub use driver::{ServiceMessageError, SessionDriver, StateSnapshot, TaskScriptRequest};
pub use hooks::{NoRequestHooks, RequestHookEventProvider};
pub use upload::UploadRewriter;

/// Per-session request options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Credentials answered to Basic/NTLM challenges.
    pub credentials: Option<Credentials>,
    /// Upstream proxy all destination traffic goes through.
    pub external_proxy: Option<ExternalProxy>,
    /// Never negotiate HTTP/2 for this session.
    pub disable_http2: bool,
    /// Overrides `transport.page_request_secs`.
    pub page_request_timeout: Option<Duration>,
    /// Overrides `transport.ajax_request_secs`.
    pub ajax_request_timeout: Option<Duration>,
}

/// One browser session under test.
pub struct Session {
    id: String,
    options: SessionOptions,
    cookies: Arc<dyn CookieJar>,
    hooks: Arc<dyn RequestHookEventProvider>,
    uploads: Option<Arc<dyn UploadRewriter>>,
    driver: Arc<dyn SessionDriver>,
    pending_snapshot: Mutex<Option<StateSnapshot>>,
}

impl Session {
    pub fn builder(id: impl Into<String>, driver: Arc<dyn SessionDriver>) -> SessionBuilder {
        SessionBuilder {
            id: id.into(),
            options: SessionOptions::default(),
            cookies: Arc::new(NoCookieJar),
            hooks: Arc::new(NoRequestHooks),
            uploads: None,
            driver,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn cookies(&self) -> &dyn CookieJar {
        self.cookies.as_ref()
    }

    pub fn hooks(&self) -> &dyn RequestHookEventProvider {
        self.hooks.as_ref()
    }

    pub fn uploads(&self) -> Option<&dyn UploadRewriter> {
        self.uploads.as_deref()
    }

    pub fn driver(&self) -> &dyn SessionDriver {
        self.driver.as_ref()
    }

    /// Queue a snapshot to apply on the next page navigation.
    pub fn set_pending_state_snapshot(&self, snapshot: StateSnapshot) {
        *self.pending_snapshot.lock() = Some(snapshot);
    }

    /// Take the queued snapshot, if any. Only the first caller gets it.
    pub fn take_pending_state_snapshot(&self) -> Option<StateSnapshot> {
        self.pending_snapshot.lock().take()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub struct SessionBuilder {
    id: String,
    options: SessionOptions,
    cookies: Arc<dyn CookieJar>,
    hooks: Arc<dyn RequestHookEventProvider>,
    uploads: Option<Arc<dyn UploadRewriter>>,
    driver: Arc<dyn SessionDriver>,
}

impl SessionBuilder {
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cookies(mut self, cookies: Arc<dyn CookieJar>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn RequestHookEventProvider>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn uploads(mut self, uploads: Arc<dyn UploadRewriter>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn build(self) -> Session {
        Session {
            id: self.id,
            options: self.options,
            cookies: self.cookies,
            hooks: self.hooks,
            uploads: self.uploads,
            driver: self.driver,
            pending_snapshot: Mutex::new(None),
        }
    }
}

/// Table of open sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous one with the same id.
    pub fn open(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        tracing::info!(session_id = %session.id(), "Session opened");
        self.sessions.insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    pub fn close(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            tracing::info!(session_id = %id, "Session closed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Driver that echoes messages back and serves a fixed script.
    pub struct EchoDriver;

    #[async_trait]
    impl SessionDriver for EchoDriver {
        async fn handle_service_message(&self, message: Value) -> Result<Value, ServiceMessageError> {
            Ok(message)
        }

        fn task_script(&self, request: &TaskScriptRequest) -> String {
            format!(
                "/* task {} window={} iframe={} */",
                request.session_id,
                request.window_id.as_deref().unwrap_or("-"),
                request.is_iframe
            )
        }
    }

    pub fn session(id: &str) -> Session {
        Session::builder(id, Arc::new(EchoDriver)).build()
    }
}

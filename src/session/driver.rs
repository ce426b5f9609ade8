//! Session driver interface: the harness side of a session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure returned by the driver for a service message.
#[derive(Debug, Clone, Error)]
#[error("service message failed: {message}")]
pub struct ServiceMessageError {
    pub message: String,
}

/// Parameters of a task script request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskScriptRequest {
    pub session_id: String,
    pub window_id: Option<String>,
    /// Destination URL of the page requesting the script.
    pub referer: Option<String>,
    pub is_iframe: bool,
}

/// Cookies and storages captured from another run, replayed on the next
/// page navigation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub cookies: Option<String>,
    #[serde(default)]
    pub storages: Value,
}

#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Handle a message posted by injected client code.
    async fn handle_service_message(&self, message: Value) -> Result<Value, ServiceMessageError>;

    /// Script text served from the task script routes.
    fn task_script(&self, request: &TaskScriptRequest) -> String;

    /// Report a failure to load a page.
    fn on_page_error(&self, _url: &str, _message: &str) {}
}

//! Built-in service routes delegated to the session driver.
//!
//! # Responsibilities
//! - `POST /messaging`: relay JSON messages from injected client code
//! - `GET /task.js` and `GET /iframe-task.js`: serve the per-page task script
//!
//! # Design Decisions
//! - The session is found from the message itself (`sessionId`) or from
//!   the proxy URL in the `Referer` header, never from the request path

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode};
use serde_json::Value;

use crate::pipeline::error::{not_found, text_response};
use crate::proxy_url;
use crate::routing::matcher::RouteParams;
use crate::routing::router::{RouteHandler, ServiceRouter};
use crate::session::{SessionRegistry, TaskScriptRequest};

pub const MESSAGING_PATH: &str = "/messaging";
pub const TASK_SCRIPT_PATH: &str = "/task.js";
pub const IFRAME_TASK_SCRIPT_PATH: &str = "/iframe-task.js";

impl ServiceRouter {
    /// A router with the messaging and task script routes registered.
    pub fn with_service_routes(sessions: Arc<SessionRegistry>, max_body_size: usize) -> Self {
        let mut router = Self::new();
        router.add(
            Method::POST,
            MESSAGING_PATH,
            Arc::new(MessagingRoute {
                sessions: Arc::clone(&sessions),
                max_body_size,
            }),
        );
        router.add(
            Method::GET,
            TASK_SCRIPT_PATH,
            Arc::new(TaskScriptRoute {
                sessions: Arc::clone(&sessions),
                is_iframe: false,
            }),
        );
        router.add(
            Method::GET,
            IFRAME_TASK_SCRIPT_PATH,
            Arc::new(TaskScriptRoute {
                sessions,
                is_iframe: true,
            }),
        );
        router
    }
}

struct MessagingRoute {
    sessions: Arc<SessionRegistry>,
    max_body_size: usize,
}

#[async_trait]
impl RouteHandler for MessagingRoute {
    async fn handle(&self, req: Request<Body>, _params: RouteParams) -> Response<Body> {
        let body = match axum::body::to_bytes(req.into_body(), self.max_body_size).await {
            Ok(body) => body,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        let message: Value = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, format!("Invalid message: {e}")),
        };

        let session = message
            .get("sessionId")
            .and_then(Value::as_str)
            .and_then(|id| self.sessions.get(id));
        let Some(session) = session else {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Session is not opened in proxy".to_string(),
            );
        };

        match session.driver().handle_service_message(message).await {
            Ok(result) => {
                let mut response = Response::new(Body::from(result.to_string()));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Service message failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.message)
            }
        }
    }
}

struct TaskScriptRoute {
    sessions: Arc<SessionRegistry>,
    is_iframe: bool,
}

#[async_trait]
impl RouteHandler for TaskScriptRoute {
    async fn handle(&self, req: Request<Body>, _params: RouteParams) -> Response<Body> {
        let referer = req
            .headers()
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .and_then(proxy_url::decode);
        let Some(referer) = referer else {
            return not_found();
        };
        let Some(session) = self.sessions.get(&referer.session_id) else {
            return not_found();
        };

        let script = session.driver().task_script(&TaskScriptRequest {
            session_id: referer.session_id.clone(),
            window_id: referer.window_id.clone(),
            referer: Some(referer.dest_url.clone()),
            is_iframe: self.is_iframe,
        });

        let mut response = Response::new(Body::from(script));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-javascript"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        response
    }
}

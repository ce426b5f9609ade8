//! Request hook interface.
//!
//! Hook rules are registered by the harness; the pipeline asks the provider
//! which rules match a request and then fires `onRequest`,
//! `onConfigureResponse` and `onResponse` events for each of them.

use std::fmt;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use thiserror::Error;

/// Snapshot of a proxied request as seen by hooks.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: String,
    pub session_id: String,
    pub url: String,
    pub method: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub is_ajax: bool,
}

/// Opaque handle to a registered hook rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFilterRule {
    pub id: String,
}

impl RequestFilterRule {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// What a rule wants to see in its `onResponse` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigureResponseOptions {
    pub include_headers: bool,
    pub include_body: bool,
}

/// Synthetic response supplied by a hook instead of a real fetch.
#[derive(Debug, Clone)]
pub struct ResponseMock {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseMock {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// `onRequest`: hooks may rewrite the outbound request or attach a mock.
#[derive(Debug, Clone)]
pub struct OnRequestEvent {
    pub request: RequestInfo,
    pub mock: Option<ResponseMock>,
}

/// `onConfigureResponse`: hooks may edit browser-facing headers and choose
/// what their `onResponse` event will carry.
#[derive(Debug, Clone)]
pub struct OnConfigureResponseEvent {
    pub request_id: String,
    pub options: ConfigureResponseOptions,
    pub headers: HeaderMap,
}

/// `onResponse`: read-only view of the final response.
#[derive(Debug, Clone)]
pub struct OnResponseEvent {
    pub request_id: String,
    pub status: StatusCode,
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
    pub is_same_origin_policy_failed: bool,
}

#[derive(Debug, Clone)]
pub enum RequestEvent {
    Request(OnRequestEvent),
    ConfigureResponse(OnConfigureResponseEvent),
    Response(OnResponseEvent),
}

impl RequestEvent {
    pub fn name(&self) -> RequestEventName {
        match self {
            RequestEvent::Request(_) => RequestEventName::OnRequest,
            RequestEvent::ConfigureResponse(_) => RequestEventName::OnConfigureResponse,
            RequestEvent::Response(_) => RequestEventName::OnResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEventName {
    OnRequest,
    OnConfigureResponse,
    OnResponse,
}

impl fmt::Display for RequestEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestEventName::OnRequest => "onRequest",
            RequestEventName::OnConfigureResponse => "onConfigureResponse",
            RequestEventName::OnResponse => "onResponse",
        };
        f.write_str(name)
    }
}

/// Failure raised by a hook callback.
#[derive(Debug, Clone, Error)]
#[error("{event} hook failed: {message}")]
pub struct HookError {
    pub event: RequestEventName,
    pub message: String,
}

/// Source of hook rules and callbacks for one session.
#[async_trait]
pub trait RequestHookEventProvider: Send + Sync {
    /// Cheap check used to skip rule matching entirely.
    fn has_request_event_listeners(&self) -> bool;

    async fn get_request_filter_rules(&self, info: &RequestInfo) -> Vec<RequestFilterRule>;

    async fn call_request_event_callback(
        &self,
        rule: &RequestFilterRule,
        event: &mut RequestEvent,
    ) -> Result<(), HookError>;

    async fn get_mock(&self, rule: &RequestFilterRule) -> Option<ResponseMock>;

    /// Per-rule error handler.
    async fn handle_error(&self, rule: &RequestFilterRule, error: HookError);
}

/// Fire `event` for one rule, isolating its failure from siblings.
///
/// Returns `false` when the callback failed (the rule's error handler has
/// already been invoked).
pub async fn call_for_rule(
    provider: &dyn RequestHookEventProvider,
    rule: &RequestFilterRule,
    event: &mut RequestEvent,
) -> bool {
    match provider.call_request_event_callback(rule, event).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(rule = %rule.id, event = %error.event, error = %error.message, "Request hook failed");
            provider.handle_error(rule, error).await;
            false
        }
    }
}

/// Provider with no rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRequestHooks;

#[async_trait]
impl RequestHookEventProvider for NoRequestHooks {
    fn has_request_event_listeners(&self) -> bool {
        false
    }

    async fn get_request_filter_rules(&self, _info: &RequestInfo) -> Vec<RequestFilterRule> {
        Vec::new()
    }

    async fn call_request_event_callback(
        &self,
        _rule: &RequestFilterRule,
        _event: &mut RequestEvent,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn get_mock(&self, _rule: &RequestFilterRule) -> Option<ResponseMock> {
        None
    }

    async fn handle_error(&self, _rule: &RequestFilterRule, _error: HookError) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FailingFirst {
        handled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RequestHookEventProvider for FailingFirst {
        fn has_request_event_listeners(&self) -> bool {
            true
        }

        async fn get_request_filter_rules(&self, _info: &RequestInfo) -> Vec<RequestFilterRule> {
            vec![RequestFilterRule::new("a"), RequestFilterRule::new("b")]
        }

        async fn call_request_event_callback(
            &self,
            rule: &RequestFilterRule,
            event: &mut RequestEvent,
        ) -> Result<(), HookError> {
            if rule.id == "a" {
                return Err(HookError {
                    event: event.name(),
                    message: "boom".into(),
                });
            }
            if let RequestEvent::ConfigureResponse(e) = event {
                e.options.include_body = true;
            }
            Ok(())
        }

        async fn get_mock(&self, _rule: &RequestFilterRule) -> Option<ResponseMock> {
            None
        }

        async fn handle_error(&self, rule: &RequestFilterRule, error: HookError) {
            self.handled.lock().push(format!("{}:{}", rule.id, error));
        }
    }

    #[tokio::test]
    async fn failing_rule_does_not_stop_siblings() {
        let provider = FailingFirst {
            handled: Mutex::new(Vec::new()),
        };
        let rules = [RequestFilterRule::new("a"), RequestFilterRule::new("b")];
        let mut outcomes = Vec::new();

        for rule in &rules {
            let mut event = RequestEvent::ConfigureResponse(OnConfigureResponseEvent {
                request_id: "r1".into(),
                options: ConfigureResponseOptions::default(),
                headers: HeaderMap::new(),
            });
            let ok = call_for_rule(&provider, rule, &mut event).await;
            let include_body = match event {
                RequestEvent::ConfigureResponse(e) => e.options.include_body,
                _ => false,
            };
            outcomes.push((ok, include_body));
        }

        assert_eq!(outcomes, vec![(false, false), (true, true)]);
        assert_eq!(
            provider.handled.lock().as_slice(),
            ["a:onConfigureResponse hook failed: boom"]
        );
    }
}

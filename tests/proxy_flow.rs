//! End-to-end tests of the request pipeline against mock destinations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use rewrite_proxy::pipeline::{ProcessingError, ProcessingInput, ProcessingOutcome, ResourceProcessor};
use rewrite_proxy::session::hooks::{HookError, RequestEvent, RequestEventName, RequestFilterRule, RequestInfo, ResponseMock};
use rewrite_proxy::session::{RequestHookEventProvider, Session, SessionOptions};
use rewrite_proxy::transport::Credentials;

mod common;

use common::{client, http_response, session, start_backend, start_mock_backend, start_proxy, start_proxy_with, test_config, TestDriver};

const AJAX_MARKER: &str = "x-rewrite-proxy-ajax";

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(format!("http://{}/favicon.ico", proxy.same_origin))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.text().await.unwrap(), "Not Found");

    // Well-formed proxy URL, but no such session.
    let res = client()
        .get(proxy.url("missing", "", "http://example.com/"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plain_resources_are_relayed_with_restored_host() {
    let (backend, log) = start_mock_backend(http_response(
        "200 OK",
        &[("Content-Type", "image/png"), ("X-Custom", "kept")],
        "PNGDATA",
    ))
    .await;
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/img.png")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-custom"], "kept");
    assert_eq!(res.text().await.unwrap(), "PNGDATA");

    let requests = log.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/img.png");
    assert_eq!(requests[0].header("host"), Some(backend.to_string().as_str()));
}

#[tokio::test]
async fn redirect_location_points_back_at_proxy() {
    let (backend, _) = start_mock_backend(http_response("302 Found", &[("Location", "/next")], "")).await;
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/start")))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(
        res.headers()["location"],
        format!("{}/sid/http://{backend}/next", proxy.origin()).as_str()
    );
}

#[tokio::test]
async fn basic_challenge_is_answered_exactly_once() {
    let (backend, log) = start_backend(|_, _| {
        http_response("401 Unauthorized", &[("WWW-Authenticate", "Basic realm=\"test\"")], "denied")
    })
    .await;
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(
        Session::builder("sid", Arc::new(TestDriver))
            .options(SessionOptions {
                credentials: Some(Credentials::new("user", "pass")),
                ..Default::default()
            })
            .build(),
    );

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/secret")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let requests = log.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("authorization"), None);
    assert_eq!(requests[1].header("authorization"), Some("Basic dXNlcjpwYXNz"));
}

#[tokio::test]
async fn cross_origin_ajax_without_acao_fails_same_origin_check() {
    let (backend, _) = start_mock_backend(http_response(
        "200 OK",
        &[("Content-Type", "application/json")],
        "{\"secret\":1}",
    ))
    .await;
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));
    let dest = format!("http://{backend}/data");

    let cross = client()
        .get(proxy.url("sid", "", &dest))
        .header(AJAX_MARKER, "true")
        .header("referer", proxy.url("sid", "", "http://other.test/page"))
        .send()
        .await
        .unwrap();
    assert_eq!(cross.status().as_u16(), 222);
    assert_eq!(cross.text().await.unwrap(), "");

    let same = client()
        .get(proxy.url("sid", "", &dest))
        .header(AJAX_MARKER, "true")
        .header("referer", proxy.url("sid", "", &format!("http://{backend}/page")))
        .send()
        .await
        .unwrap();
    assert_eq!(same.status(), StatusCode::OK);
    assert_eq!(same.text().await.unwrap(), "{\"secret\":1}");
}

#[tokio::test]
async fn cached_scripts_skip_the_destination() {
    let (backend, log) = start_mock_backend(http_response(
        "200 OK",
        &[("Content-Type", "application/javascript"), ("Cache-Control", "max-age=300")],
        "var cached = true;",
    ))
    .await;
    let mut config = test_config();
    config.cache.enabled = true;
    let proxy = start_proxy(config).await;
    proxy.open_session(session("sid"));
    let url = proxy.url("sid", "s", &format!("http://{backend}/app.js"));

    for _ in 0..2 {
        let res = client().get(&url).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text().await.unwrap(), "var cached = true;");
        // Cache insertion happens after the body is handed off.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn local_files_are_served() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "from disk").unwrap();
    let file_url = url::Url::from_file_path(&path).unwrap();

    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", file_url.as_str()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "from disk");

    let missing = url::Url::from_file_path(dir.path().join("missing.txt")).unwrap();
    let res = client()
        .get(proxy.url("sid", "", missing.as_str()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn unreachable_page_gets_error_page() {
    // Bind then drop to get a port nobody listens on.
    let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{addr}/")))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(res.headers()["content-type"].to_str().unwrap().starts_with("text/html"));
}

#[tokio::test]
async fn failed_ajax_request_drops_the_connection() {
    let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let result = client()
        .get(proxy.url("sid", "", &format!("http://{addr}/api")))
        .header(AJAX_MARKER, "true")
        .send()
        .await;
    assert!(result.is_err());
}

/// Hook provider with one failing rule and one rule that mocks the response.
#[derive(Default)]
struct MockingHooks {
    errors: Mutex<Vec<String>>,
    events: Mutex<Vec<(String, RequestEventName)>>,
}

#[async_trait]
impl RequestHookEventProvider for MockingHooks {
    fn has_request_event_listeners(&self) -> bool {
        true
    }

    async fn get_request_filter_rules(&self, _info: &RequestInfo) -> Vec<RequestFilterRule> {
        vec![RequestFilterRule::new("broken"), RequestFilterRule::new("mock")]
    }

    async fn call_request_event_callback(
        &self,
        rule: &RequestFilterRule,
        event: &mut RequestEvent,
    ) -> Result<(), HookError> {
        self.events.lock().push((rule.id.clone(), event.name()));
        if rule.id == "broken" {
            return Err(HookError {
                event: event.name(),
                message: "boom".into(),
            });
        }
        Ok(())
    }

    async fn get_mock(&self, rule: &RequestFilterRule) -> Option<ResponseMock> {
        (rule.id == "mock").then(|| ResponseMock::new(StatusCode::IM_A_TEAPOT, "mocked"))
    }

    async fn handle_error(&self, rule: &RequestFilterRule, error: HookError) {
        self.errors.lock().push(format!("{}: {}", rule.id, error.message));
    }
}

#[tokio::test]
async fn hook_mock_replaces_destination_and_errors_stay_isolated() {
    let (backend, log) = start_mock_backend(http_response("200 OK", &[], "real")).await;
    let hooks = Arc::new(MockingHooks::default());
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(
        Session::builder("sid", Arc::new(TestDriver))
            .hooks(Arc::clone(&hooks) as Arc<dyn RequestHookEventProvider>)
            .build(),
    );

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/api")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(res.text().await.unwrap(), "mocked");

    assert!(log.lock().is_empty());
    assert!(hooks
        .events
        .lock()
        .contains(&("mock".to_string(), RequestEventName::OnRequest)));
    assert!(hooks
        .errors
        .lock()
        .iter()
        .any(|e| e.starts_with("broken: boom")));
}

/// Asks to restart with UTF-8, then upper-cases the page.
#[derive(Default)]
struct RestartingProcessor {
    calls: AtomicUsize,
    always_restart: bool,
    charsets: Mutex<Vec<String>>,
}

#[async_trait]
impl ResourceProcessor for RestartingProcessor {
    async fn process(&self, input: ProcessingInput<'_>) -> Result<ProcessingOutcome, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.charsets.lock().push(input.charset.label().to_string());
        if self.always_restart || input.allow_restart {
            return Ok(ProcessingOutcome::RestartWithCharset("utf-8".into()));
        }
        Ok(ProcessingOutcome::Rewritten(input.body.to_uppercase()))
    }
}

#[tokio::test]
async fn charset_restart_happens_at_most_once() {
    let (backend, _) = start_mock_backend(http_response(
        "200 OK",
        &[("Content-Type", "text/html")],
        "<p>caf\u{e9}</p>",
    ))
    .await;
    let processor = Arc::new(RestartingProcessor::default());
    let proxy = start_proxy_with(test_config(), Arc::clone(&processor) as Arc<dyn ResourceProcessor>).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/page")))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(!res.headers().contains_key("content-encoding"));
    assert_eq!(res.text().await.unwrap(), "<P>CAF\u{c9}</P>");

    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*processor.charsets.lock(), vec!["windows-1252".to_string(), "UTF-8".to_string()]);
}

#[tokio::test]
async fn repeated_restart_request_fails_the_page() {
    let (backend, _) = start_mock_backend(http_response("200 OK", &[("Content-Type", "text/html")], "<p>x</p>")).await;
    let processor = Arc::new(RestartingProcessor {
        always_restart: true,
        ..Default::default()
    });
    let proxy = start_proxy_with(test_config(), Arc::clone(&processor) as Arc<dyn ResourceProcessor>).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/page")))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn processed_pages_lose_csp_and_get_fresh_length() {
    let (backend, _) = start_mock_backend(http_response(
        "200 OK",
        &[
            ("Content-Type", "text/html; charset=utf-8"),
            ("Content-Security-Policy", "default-src 'self'"),
            ("Strict-Transport-Security", "max-age=100"),
        ],
        "<html></html>",
    ))
    .await;
    let proxy = start_proxy(test_config()).await;
    proxy.open_session(session("sid"));

    let res = client()
        .get(proxy.url("sid", "", &format!("http://{backend}/")))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let headers: &HeaderMap = res.headers();
    assert!(!headers.contains_key("content-security-policy"));
    assert!(!headers.contains_key("strict-transport-security"));
    assert_eq!(headers["content-length"], "13");
    assert_eq!(res.text().await.unwrap(), "<html></html>");
}

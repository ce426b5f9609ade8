//! HTTP server setup.
//!
//! # Responsibilities
//! - Bind the same-origin and cross-origin listeners
//! - Serve HTTP/1.1 and HTTP/2 with upgrades on every accepted connection
//! - Wire up tracing around each request
//! - Answer service routes, otherwise dispatch into the pipeline
//! - Drain open connections on shutdown
//!
//! # Design Decisions
//! - Both listeners share one `ProxyState`; only the `ProxyLocation` differs
//! - A pipeline abort surfaces as a service error, which makes hyper drop
//!   the client connection without a response
//! - Sessions can be opened and closed while the server runs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::{load_acceptor, ConnectionPermit, ConnectionTracker, Listener, ListenerError, TlsSetupError};
use crate::pipeline::error::not_found;
use crate::pipeline::{self, PipelineAborted, PipelineContext, PipelineServices, ResourceProcessor};
use crate::proxy_url::ProxyLocation;
use crate::routing::ServiceRouter;
use crate::session::{Session, SessionRegistry};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("destination TLS setup failed: {0}")]
    Transport(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a request handler needs, shared by both listeners.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub sessions: Arc<SessionRegistry>,
    pub services: PipelineServices,
    pub router: ServiceRouter,
}

/// The rewriting proxy: two bound listeners and their shared state.
pub struct ProxyServer {
    config: ProxyConfig,
    sessions: Arc<SessionRegistry>,
    services: PipelineServices,
    router: ServiceRouter,
    same_origin: Listener,
    cross_origin: Listener,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    /// Bind both ports and build the pipeline services.
    pub async fn bind(config: ProxyConfig, processor: Arc<dyn ResourceProcessor>) -> Result<Self, ServerError> {
        let listener_config = &config.listener;
        let tls = listener_config.tls.as_ref().map(load_acceptor).transpose()?;
        let protocol = if tls.is_some() { "https:" } else { "http:" };

        let same_origin = Listener::bind(
            &listener_config.bind_address,
            listener_config.same_origin_port,
            listener_config.max_connections,
        )
        .await?;
        let cross_origin = Listener::bind(
            &listener_config.bind_address,
            listener_config.cross_origin_port,
            listener_config.max_connections,
        )
        .await?;

        let same_origin_location = ProxyLocation::new(
            protocol,
            listener_config.hostname.clone(),
            same_origin.local_addr()?.port(),
        );
        let cross_origin_location = same_origin_location.with_port(cross_origin.local_addr()?.port());

        let sessions = Arc::new(SessionRegistry::new());
        let services = PipelineServices::new(&config, processor, same_origin_location, cross_origin_location)?;
        let router = ServiceRouter::with_service_routes(Arc::clone(&sessions), config.security.max_body_size);

        Ok(Self {
            config,
            sessions,
            services,
            router,
            same_origin,
            cross_origin,
            tls,
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn same_origin_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.same_origin.local_addr()
    }

    pub fn cross_origin_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.cross_origin.local_addr()
    }

    /// Where same-origin proxy URLs point.
    pub fn location(&self) -> &ProxyLocation {
        &self.services.same_origin
    }

    /// The open-sessions table; usable while the server runs.
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    pub fn open_session(&self, session: Session) -> Arc<Session> {
        self.sessions.open(session)
    }

    /// Register additional static or parametrized routes before `run`.
    pub fn router_mut(&mut self) -> &mut ServiceRouter {
        &mut self.router
    }

    /// Serve both listeners until `shutdown` fires, then drain.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ServerError> {
        let grace = Duration::from_secs(self.config.lifecycle.shutdown_grace_secs);
        let same_origin_location = self.services.same_origin.clone();
        let cross_origin_location = self.services.cross_origin.clone();
        let tracker = self.tracker.clone();

        let state = Arc::new(ProxyState {
            config: self.config,
            sessions: self.sessions,
            services: self.services,
            router: self.router,
        });

        tracing::info!(
            same_origin = %same_origin_location.origin(),
            cross_origin = %cross_origin_location.origin(),
            "Proxy server starting"
        );

        let same_origin = accept_loop(
            self.same_origin,
            same_origin_location,
            Arc::clone(&state),
            self.tls.clone(),
            tracker.clone(),
            shutdown.subscribe(),
        );
        let cross_origin = accept_loop(
            self.cross_origin,
            cross_origin_location,
            state,
            self.tls,
            tracker.clone(),
            shutdown.subscribe(),
        );
        tokio::join!(same_origin, cross_origin);

        tracing::info!(active = tracker.active_count(), "Draining connections");
        if !tracker.wait_idle(grace).await {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Grace period elapsed with open connections"
            );
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: Listener,
    location: ProxyLocation,
    state: Arc<ProxyState>,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let connection = Connection {
            location: location.clone(),
            state: Arc::clone(&state),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
            permit,
            peer,
        };
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => connection.serve_tls(acceptor, stream).await,
                None => connection.serve(stream).await,
            }
        });
    }

    tracing::debug!(port = location.port, "Listener stopped accepting");
}

struct Connection {
    location: ProxyLocation,
    state: Arc<ProxyState>,
    tracker: ConnectionTracker,
    shutdown: ShutdownSignal,
    permit: ConnectionPermit,
    peer: SocketAddr,
}

impl Connection {
    async fn serve_tls(self, acceptor: TlsAcceptor, stream: TcpStream) {
        match acceptor.accept(stream).await {
            Ok(stream) => self.serve(stream).await,
            Err(e) => tracing::debug!(peer_addr = %self.peer, error = %e, "TLS handshake failed"),
        }
    }

    async fn serve<I>(self, io: I)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Connection {
            location,
            state,
            tracker,
            mut shutdown,
            permit,
            peer,
        } = self;
        let guard = tracker.track();
        let _permit = permit;

        let service = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&state);
                let location = location.clone();
                async move { handle(state, location, req.map(Body::new)).await }
            });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(service));
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };

        if let Err(e) = result {
            tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, error = %e, "Connection ended with error");
        }
    }
}

/// Route one request: service routes first, then the pipeline.
async fn handle(
    state: Arc<ProxyState>,
    location: ProxyLocation,
    req: Request<Body>,
) -> Result<Response<Body>, PipelineAborted> {
    let req = match state.router.route(req).await {
        Ok(response) => return Ok(response),
        Err(req) => req,
    };

    let ctx = match PipelineContext::dispatch(req, &state.sessions, location) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::debug!(error = %e, "Request not dispatched");
            return Ok(not_found());
        }
    };

    pipeline::run(ctx, &state.services).await
}

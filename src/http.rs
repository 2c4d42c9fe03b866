//! HTTP server part of the record relay

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Level, info, span, warn};

mod error;
mod records;

use crate::{metrics::Metrics, state::AppState};

pub use self::error::{AppError, AppResult};

/// Config for the HTTP server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset)
    pub bind_addr: Option<IpAddr>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_addr: None,
        }
    }
}

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum HttpError {
    #[snafu(display("failed to bind HTTP server to {addr}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("HTTP server failed"))]
    Serve { source: std::io::Error },
    #[snafu(display("HTTP server task panicked"))]
    Panic { source: tokio::task::JoinError },
}

/// The HTTP server part of the record relay
#[derive(Debug)]
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
}

impl HttpServer {
    /// Spawn the server
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer, HttpError> {
        let app = create_app(state);
        let mut tasks = JoinSet::new();

        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr)
            .await
            .and_then(|l| l.into_std())
            .context(BindSnafu { addr: bind_addr })?;
        let http_addr = listener.local_addr().context(BindSnafu { addr: bind_addr })?;
        let fut = axum_server::from_tcp(listener)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        info!("HTTP server listening on {http_addr}");
        tasks.spawn(fut);

        Ok(HttpServer { tasks, http_addr })
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Shutdown the server and wait for all tasks to complete.
    pub async fn shutdown(mut self) -> Result<(), HttpError> {
        self.tasks.abort_all();
        self.run_until_done().await
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<(), HttpError> {
        let mut final_res = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(err).context(ServeSnafu);
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err).context(PanicSnafu);
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::PUT])
        // allow requests from any origin
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let src = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|conn_info| conn_info.0.to_string());
        span!(
            Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = ?src,
        )
    });

    let metrics = state.metrics.clone();

    // configure routes
    let router = Router::new()
        .route("/healthcheck", get(|| async { "OK" }))
        .route(
            "/",
            get(records::missing_identifier).put(records::missing_identifier),
        )
        .route("/{identifier}", get(records::get).put(records::put))
        .with_state(state);

    // configure app
    router
        .layer(cors)
        .layer(trace)
        .route_layer(middleware::from_fn_with_state(metrics, metrics_middleware))
}

/// Record request metrics.
async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    metrics.http_requests_duration_ms.inc_by(latency as u64);
    metrics.http_requests.inc();
    if status.is_success() {
        metrics.http_requests_success.inc();
    } else {
        metrics.http_requests_error.inc();
    }
    response
}

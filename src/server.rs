use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::RelaySettings;
use crate::metrics::{PROMETHEUS_CONTENT_TYPE, RelayMetrics};
use crate::provider::ProviderRegistry;
use crate::router::{DispatchError, DohRouter, apply_cors_headers};
use crate::transport::{ReqwestTransport, UpstreamTransport};
use crate::translate::InboundRequest;

const PREFLIGHT_MAX_AGE: &str = "86400";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Long-running DoH listener wired to the forwarding core.
pub struct RelayDaemon {
    settings: RelaySettings,
    router: Arc<DohRouter<ReqwestTransport>>,
}

impl RelayDaemon {
    /// Build the daemon. Fails when the provider registry is invalid.
    pub fn new(settings: RelaySettings) -> Result<Self> {
        let registry = settings
            .registry()
            .context("Refusing to start with an invalid provider registry")?;
        let transport = ReqwestTransport::from_settings(&settings.upstream)?;
        let user_agent = HeaderValue::from_str(&settings.upstream.user_agent)
            .context("upstream.user_agent is not a valid header value")?;
        let metrics = RelayMetrics::new().context("Failed to initialise relay metrics")?;

        let router = DohRouter::new(
            Arc::new(registry),
            transport,
            user_agent,
            Duration::from_secs(settings.cache.ttl_seconds),
            Arc::new(metrics),
        );

        Ok(Self {
            settings,
            router: Arc::new(router),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.router.registry()
    }

    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .settings
            .server
            .listen
            .parse()
            .with_context(|| {
                format!(
                    "Invalid DoH listener address: {}",
                    self.settings.server.listen
                )
            })?;
        let path = self.settings.server.normalised_path();
        let app = build_app(self.router.clone(), &path);

        for provider in self.registry().providers() {
            info!(
                provider = %provider.name,
                url = %provider.url,
                weight = provider.weight,
                "Registered upstream provider"
            );
        }

        let doh_server = async {
            match self.settings.server.tls_paths() {
                Some((cert, key)) => {
                    let tls = RustlsConfig::from_pem_file(cert, key)
                        .await
                        .with_context(|| {
                            format!(
                                "Failed to load TLS certificate {} / key {}",
                                cert.display(),
                                key.display()
                            )
                        })?;
                    let handle = Handle::new();
                    tokio::spawn(graceful_on(handle.clone(), shutdown_signal()));
                    info!(listener = %addr, path = %path, "Starting dohrelay HTTPS listener");
                    axum_server::bind_rustls(addr, tls)
                        .handle(handle)
                        .serve(app.into_make_service())
                        .await
                        .context("dohrelay HTTPS listener terminated unexpectedly")
                }
                None => {
                    if self.settings.server.tls_cert_path.is_some()
                        || self.settings.server.tls_key_path.is_some()
                    {
                        warn!("TLS needs both tls_cert_path and tls_key_path; serving plain HTTP");
                    }
                    let listener = TcpListener::bind(addr)
                        .await
                        .with_context(|| format!("Failed to bind DoH listener at {addr}"))?;
                    info!(listener = %addr, path = %path, "Starting dohrelay HTTP listener");
                    axum::serve(listener, app.into_make_service())
                        .with_graceful_shutdown(shutdown_signal())
                        .await
                        .context("dohrelay HTTP listener terminated unexpectedly")
                }
            }
        };

        match self.settings.server.metrics_listen.clone() {
            Some(metrics_addr) => {
                let metrics = self.router.metrics().clone();
                tokio::try_join!(doh_server, run_metrics_server(&metrics_addr, metrics))?;
            }
            None => doh_server.await?,
        }

        info!("dohrelay stopped");
        Ok(())
    }
}

/// HTTP surface: the DoH route on `path`, 400 for every other path.
pub fn build_app<T: UpstreamTransport>(router: Arc<DohRouter<T>>, path: &str) -> Router {
    Router::new()
        .route(path, any(doh_handler::<T>))
        .fallback(invalid_endpoint)
        .with_state(router)
}

async fn doh_handler<T: UpstreamTransport>(
    State(router): State<Arc<DohRouter<T>>>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return preflight_response();
    }

    let inbound = match InboundRequest::from_parts(&method, query, headers, body) {
        Ok(inbound) => inbound,
        Err(err) => {
            router.metrics().inc_request();
            router.metrics().inc_rejected();
            return err.into_response();
        }
    };

    match router.dispatch(inbound).await {
        Ok(response) => response.into_response(),
        Err(err) => {
            if matches!(err, DispatchError::AllProvidersExhausted { .. }) {
                error!(error = %err, "Returning 503 to client");
            }
            err.into_response()
        }
    }
}

fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    apply_cors_headers(headers);
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(PREFLIGHT_MAX_AGE),
    );
    response
}

async fn invalid_endpoint() -> Response {
    (StatusCode::BAD_REQUEST, "Invalid endpoint").into_response()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping dohrelay");
}

async fn graceful_on(handle: Handle<SocketAddr>, signal: impl Future<Output = ()>) {
    signal.await;
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

async fn run_metrics_server(addr: &str, metrics: Arc<RelayMetrics>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting dohrelay metrics server");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("dohrelay metrics server terminated unexpectedly")
}

async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render relay metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

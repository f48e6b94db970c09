//! Upstream routing and failover.
//!
//! A request goes to one weighted-random provider first. Only a transport
//! failure on that primary attempt triggers failover, which walks the rest of
//! the registry in order and accepts the first 2xx answer. The primary choice
//! never learns from failures; there is no health state between requests.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::metrics::RelayMetrics;
use crate::provider::{Provider, ProviderRegistry};
use crate::selector::WeightedSelector;
use crate::transport::{TransportError, UpstreamResponse, UpstreamTransport};
use crate::translate::{DnsMethod, InboundRequest, strip_hop_by_hop, translate};

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
pub const ALLOW_HEADERS: &str = "Content-Type, Accept";
pub const EXHAUSTED_MESSAGE: &str = "All DNS providers are unavailable";

/// Failures that reach the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("All DNS providers are unavailable")]
    AllProvidersExhausted { attempts: usize },
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DispatchError::AllProvidersExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        if matches!(self, DispatchError::MethodNotAllowed) {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(ALLOW_METHODS));
        }
        response
    }
}

/// Why one attempt did not produce a usable answer. Absorbed by failover.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("upstream answered {0}")]
    NonSuccess(StatusCode),
}

impl AttemptError {
    fn kind(&self) -> &'static str {
        match self {
            AttemptError::Transport(err) => err.kind(),
            AttemptError::NonSuccess(_) => "status",
        }
    }
}

/// Final response handed to the entry point.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub provider: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for RelayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Primary,
    Failover,
}

/// Forwarding core shared by every request handler.
pub struct DohRouter<T> {
    registry: Arc<ProviderRegistry>,
    transport: T,
    selector: WeightedSelector,
    user_agent: HeaderValue,
    cache_ttl: Duration,
    metrics: Arc<RelayMetrics>,
}

impl<T: UpstreamTransport> DohRouter<T> {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        transport: T,
        user_agent: HeaderValue,
        cache_ttl: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            transport,
            selector: WeightedSelector::new(),
            user_agent,
            cache_ttl,
            metrics,
        }
    }

    pub fn with_selector(mut self, selector: WeightedSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Validate, forward to a weighted-random provider, and fail over on
    /// transport errors.
    pub async fn dispatch(&self, inbound: InboundRequest) -> Result<RelayResponse, DispatchError> {
        let span = info_span!(
            "dispatch",
            request_id = %Uuid::new_v4(),
            method = %inbound.method
        );
        self.dispatch_inner(inbound).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        inbound: InboundRequest,
    ) -> Result<RelayResponse, DispatchError> {
        self.metrics.inc_request();

        if inbound.method == DnsMethod::Get && !inbound.has_dns_param() {
            self.metrics.inc_rejected();
            debug!("GET without dns parameter");
            return Err(DispatchError::BadRequest("Missing dns parameter"));
        }

        let primary = self.selector.select(&self.registry);
        debug!(provider = %primary.name, "Selected primary provider");

        match self.attempt(&inbound, primary, Stage::Primary).await {
            Ok(response) => Ok(self.finish(&primary.name, response, Stage::Primary)),
            Err(err) => {
                warn!(
                    provider = %primary.name,
                    error = %err,
                    "Primary provider failed; failing over"
                );
                self.metrics.inc_failover();
                self.failover(&inbound, &primary.name).await
            }
        }
    }

    /// Try every provider except `excluded`, in registry order, until one answers 2xx.
    async fn failover(
        &self,
        inbound: &InboundRequest,
        excluded: &str,
    ) -> Result<RelayResponse, DispatchError> {
        let mut attempts = 1;
        for candidate in self.registry.fallback_candidates(excluded) {
            attempts += 1;
            match self.attempt(inbound, candidate, Stage::Failover).await {
                Ok(response) => {
                    info!(provider = %candidate.name, "Fallback provider answered");
                    return Ok(self.finish(&candidate.name, response, Stage::Failover));
                }
                Err(err) => {
                    warn!(provider = %candidate.name, error = %err, "Fallback provider failed");
                }
            }
        }

        self.metrics.inc_exhausted();
        warn!(attempts, "Every DNS provider failed");
        Err(DispatchError::AllProvidersExhausted { attempts })
    }

    async fn attempt(
        &self,
        inbound: &InboundRequest,
        provider: &Provider,
        stage: Stage,
    ) -> Result<UpstreamResponse, AttemptError> {
        let attempt = translate(inbound, provider, &self.user_agent);
        let result = match self.transport.send(attempt).await {
            Ok(response) if stage == Stage::Failover && !response.status.is_success() => {
                Err(AttemptError::NonSuccess(response.status))
            }
            Ok(response) => Ok(response),
            Err(err) => Err(AttemptError::from(err)),
        };

        if let Err(err) = &result {
            self.metrics.inc_upstream_failure(&provider.name, err.kind());
        }
        result
    }

    fn finish(&self, provider: &str, upstream: UpstreamResponse, stage: Stage) -> RelayResponse {
        self.metrics.inc_upstream_response(provider);

        let mut headers = upstream.headers;
        strip_hop_by_hop(&mut headers);
        apply_cors_headers(&mut headers);

        let max_age = self.cache_ttl.as_secs();
        if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        if stage == Stage::Primary {
            match expires_at(Utc::now(), max_age) {
                Some(expires) => {
                    if let Ok(value) = HeaderValue::from_str(&http_date(expires)) {
                        headers.insert(header::EXPIRES, value);
                    }
                }
                None => debug!(max_age, "Cache TTL out of date range; omitting Expires"),
            }
        }

        RelayResponse {
            provider: provider.to_string(),
            status: upstream.status,
            headers,
            body: upstream.body,
        }
    }
}

/// Insert the fixed cross-origin headers, replacing any upstream values.
pub fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

/// `now + ttl_seconds`, or `None` when that falls outside chrono's range.
fn expires_at(now: DateTime<Utc>, ttl_seconds: u64) -> Option<DateTime<Utc>> {
    let ttl = i64::try_from(ttl_seconds).ok().and_then(TimeDelta::try_seconds)?;
    now.checked_add_signed(ttl)
}

/// IMF-fixdate, as used by `Expires`.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

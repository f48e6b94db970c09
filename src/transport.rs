use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use reqwest::{Client, redirect};
use thiserror::Error;

use crate::config::UpstreamSection;
use crate::translate::UpstreamAttempt;

/// Upstream answer, fully read.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Network or protocol failure while talking to a provider.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("could not connect to upstream: {0}")]
    Connect(String),
    #[error("failed to read upstream body: {0}")]
    Body(String),
    #[error("upstream request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Body(_) => "body",
            TransportError::Request(_) => "request",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Issues one upstream attempt.
pub trait UpstreamTransport: Send + Sync + 'static {
    fn send(
        &self,
        attempt: UpstreamAttempt,
    ) -> impl Future<Output = Result<UpstreamResponse, TransportError>> + Send;
}

/// reqwest-backed transport. Follows redirects so clients never see them.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn from_settings(settings: &UpstreamSection) -> Result<Self> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::limited(settings.max_redirects))
            .user_agent(settings.user_agent.clone());
        if settings.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(settings.timeout_ms));
        }
        let client = builder.build().context("Failed to build upstream HTTP client")?;
        Ok(Self { client })
    }
}

impl UpstreamTransport for ReqwestTransport {
    async fn send(&self, attempt: UpstreamAttempt) -> Result<UpstreamResponse, TransportError> {
        let mut request = self
            .client
            .request(attempt.method.as_method(), &attempt.url)
            .headers(attempt.headers);
        if let Some(body) = attempt.body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Body(err.to_string())
            }
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use crate::provider::{Provider, ProviderRegistry};
    use crate::router::DohRouter;
    use crate::selector::{RandomSource, WeightedSelector};
    use crate::translate::{DNS_CONTENT_TYPE, DnsMethod, InboundRequest};
    use axum::Router;
    use axum::extract::RawQuery;
    use axum::http::{HeaderValue, header};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::{get, post};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_upstream() -> String {
        async fn echo_body(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("missing"));
            (
                [(header::CONTENT_TYPE, HeaderValue::from_static(DNS_CONTENT_TYPE))],
                [("x-seen-content-type", content_type)],
                body,
            )
        }

        async fn echo_query(RawQuery(query): RawQuery) -> String {
            query.unwrap_or_default()
        }

        let app = Router::new()
            .route("/dns-query", post(echo_body).get(echo_query))
            .route(
                "/moved",
                get(|RawQuery(query): RawQuery| async move {
                    Redirect::temporary(&format!("/dns-query?{}", query.unwrap_or_default()))
                }),
            )
            .route("/broken", get(|| async { StatusCode::BAD_GATEWAY }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        format!("http://{addr}")
    }

    fn attempt(url: String, method: DnsMethod, body: Option<Bytes>) -> UpstreamAttempt {
        let mut headers = HeaderMap::new();
        if method == DnsMethod::Post {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DNS_CONTENT_TYPE),
            );
        }
        UpstreamAttempt {
            provider: "local".into(),
            url,
            method,
            headers,
            body,
        }
    }

    fn transport() -> ReqwestTransport {
        ReqwestTransport::from_settings(&UpstreamSection::default()).expect("client")
    }

    fn transport_with_timeout(timeout_ms: u64) -> ReqwestTransport {
        let settings = UpstreamSection {
            timeout_ms,
            ..UpstreamSection::default()
        };
        ReqwestTransport::from_settings(&settings).expect("client")
    }

    struct First;

    impl RandomSource for First {
        fn below(&self, _bound: u64) -> u64 {
            0
        }
    }

    #[tokio::test]
    async fn post_body_reaches_upstream_unchanged() {
        let base = spawn_upstream().await;
        let payload = Bytes::from(vec![0u8, 1, 2, 0xfe, 0xff, 0x80, 0x00, 0x7f]);
        let response = transport()
            .send(attempt(
                format!("{base}/dns-query"),
                DnsMethod::Post,
                Some(payload.clone()),
            ))
            .await
            .expect("upstream reachable");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, payload);
        assert_eq!(response.headers["x-seen-content-type"], DNS_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let base = spawn_upstream().await;
        let response = transport()
            .send(attempt(
                format!("{base}/moved?dns=AAAB"),
                DnsMethod::Get,
                None,
            ))
            .await
            .expect("upstream reachable");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"dns=AAAB"));
    }

    #[tokio::test]
    async fn non_success_status_is_not_a_transport_error() {
        let base = spawn_upstream().await;
        let response = transport()
            .send(attempt(format!("{base}/broken"), DnsMethod::Get, None))
            .await
            .expect("upstream reachable");
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let err = transport()
            .send(attempt(
                format!("http://{addr}/dns-query"),
                DnsMethod::Get,
                None,
            ))
            .await
            .expect_err("nothing is listening");
        assert_eq!(err.kind(), "connect");
    }

    #[tokio::test]
    async fn hanging_upstream_times_out() {
        let base = spawn_upstream().await;
        let err = transport_with_timeout(100)
            .send(attempt(format!("{base}/slow"), DnsMethod::Get, None))
            .await
            .expect_err("upstream sleeps past the timeout");
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn timed_out_primary_fails_over_to_next_provider() {
        let base = spawn_upstream().await;
        let registry = ProviderRegistry::new(vec![
            Provider::new("slow", format!("{base}/slow"), 10),
            Provider::new("fast", format!("{base}/dns-query"), 10),
        ])
        .expect("valid registry");
        let relay = DohRouter::new(
            Arc::new(registry),
            transport_with_timeout(100),
            HeaderValue::from_static("dohrelay-test"),
            Duration::from_secs(300),
            Arc::new(RelayMetrics::new().expect("metrics")),
        )
        .with_selector(WeightedSelector::with_source(First));

        let response = relay
            .dispatch(InboundRequest::get(Some("dns=AAAB".into()), HeaderMap::new()))
            .await
            .expect("fallback answered");

        assert_eq!(response.provider, "fast");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"dns=AAAB"));

        let text = String::from_utf8(relay.metrics().render().expect("render")).expect("utf8");
        assert!(text.contains(
            "dohrelay_upstream_failures_total{kind=\"timeout\",provider=\"slow\"} 1"
        ));
        assert!(text.contains("dohrelay_failovers_total 1"));
    }
}

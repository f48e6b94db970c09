//! Translation of an inbound DoH request into an upstream attempt.
//!
//! The DNS payload is never decoded: the GET query string and the POST body
//! are forwarded byte for byte.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};

use crate::provider::Provider;
use crate::router::DispatchError;

pub const DNS_CONTENT_TYPE: &str = "application/dns-message";

/// Headers that describe a single connection and must not be relayed.
pub(crate) const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Methods the forwarding core accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMethod {
    Get,
    Post,
}

impl DnsMethod {
    pub fn as_method(self) -> Method {
        match self {
            DnsMethod::Get => Method::GET,
            DnsMethod::Post => Method::POST,
        }
    }
}

impl TryFrom<&Method> for DnsMethod {
    type Error = DispatchError;

    fn try_from(method: &Method) -> Result<Self, Self::Error> {
        if method == Method::GET {
            Ok(DnsMethod::Get)
        } else if method == Method::POST {
            Ok(DnsMethod::Post)
        } else {
            Err(DispatchError::MethodNotAllowed)
        }
    }
}

impl std::fmt::Display for DnsMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsMethod::Get => write!(f, "GET"),
            DnsMethod::Post => write!(f, "POST"),
        }
    }
}

/// A client request as seen by the forwarding core.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: DnsMethod,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl InboundRequest {
    pub fn get(query: Option<String>, headers: HeaderMap) -> Self {
        Self {
            method: DnsMethod::Get,
            query,
            headers,
            body: None,
        }
    }

    pub fn post(query: Option<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method: DnsMethod::Post,
            query,
            headers,
            body: Some(body),
        }
    }

    /// Build from raw HTTP parts, rejecting anything but GET and POST.
    pub fn from_parts(
        method: &Method,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Self, DispatchError> {
        Ok(match DnsMethod::try_from(method)? {
            DnsMethod::Get => Self::get(query, headers),
            DnsMethod::Post => Self::post(query, headers, body),
        })
    }

    /// Whether a non-empty `dns` parameter is present. Its value is not inspected.
    pub fn has_dns_param(&self) -> bool {
        self.query.as_deref().is_some_and(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .any(|(key, value)| key == "dns" && !value.is_empty())
        })
    }
}

/// One forwarding try against a single provider.
#[derive(Debug, Clone)]
pub struct UpstreamAttempt {
    pub provider: String,
    pub url: String,
    pub method: DnsMethod,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Build the upstream request for `provider` from `inbound`.
pub fn translate(
    inbound: &InboundRequest,
    provider: &Provider,
    user_agent: &HeaderValue,
) -> UpstreamAttempt {
    let url = match inbound.query.as_deref() {
        Some(query) if !query.is_empty() => format!("{}?{}", provider.url, query),
        _ => provider.url.clone(),
    };

    let mut headers = inbound.headers.clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    strip_hop_by_hop(&mut headers);

    match inbound.method {
        DnsMethod::Post => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DNS_CONTENT_TYPE),
            );
        }
        DnsMethod::Get => {
            headers.insert(header::ACCEPT, HeaderValue::from_static(DNS_CONTENT_TYPE));
        }
    }
    headers.insert(header::USER_AGENT, user_agent.clone());

    let body = match inbound.method {
        DnsMethod::Post => inbound.body.clone(),
        DnsMethod::Get => None,
    };

    UpstreamAttempt {
        provider: provider.name.clone(),
        url,
        method: inbound.method,
        headers,
        body,
    }
}

pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
}

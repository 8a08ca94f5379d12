//! Reverse proxy forwarding to a single upstream.

use async_trait::async_trait;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{trace, warn};

use super::{text_response, Handler, RemoteAddr, ReqBody, RespBody};
use crate::error::{Result, SlidegateError};

type HttpClient = Client<HttpConnector, ReqBody>;

/// Headers that only apply to a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Describes things that can go wrong while forwarding a request.
#[derive(Debug, Error, Clone)]
pub enum ForwardError {
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Failed to get response from upstream: {0}")]
    Upstream(String),
}

impl From<&ForwardError> for StatusCode {
    fn from(e: &ForwardError) -> StatusCode {
        match e {
            ForwardError::InvalidUri(_) => StatusCode::BAD_REQUEST,
            ForwardError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Terminal handler forwarding every request to one upstream base URL.
///
/// The request path is appended to the upstream's path, queries are merged,
/// and `Host` is rewritten to the upstream authority.
pub struct ReverseProxy {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
    client: HttpClient,
}

impl ReverseProxy {
    /// Create a proxy for `upstream`, e.g. `http://127.0.0.1:3000/api`.
    pub fn new(upstream: &str) -> Result<Self> {
        let uri: Uri = upstream
            .parse()
            .map_err(|e| SlidegateError::UpstreamParse(format!("{}: {}", upstream, e)))?;

        let scheme = uri.scheme().cloned().ok_or_else(|| {
            SlidegateError::UpstreamParse(format!("{}: missing scheme", upstream))
        })?;
        if scheme != Scheme::HTTP {
            return Err(SlidegateError::UpstreamParse(format!(
                "{}: unsupported scheme '{}'",
                upstream, scheme
            )));
        }
        let authority = uri.authority().cloned().ok_or_else(|| {
            SlidegateError::UpstreamParse(format!("{}: missing host", upstream))
        })?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            base_query: uri.query().map(str::to_string),
            client,
        })
    }

    /// Upstream authority requests are sent to.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Map an inbound request URI onto the upstream.
    pub fn upstream_uri(&self, inbound: &Uri) -> std::result::Result<Uri, ForwardError> {
        let path = inbound.path();
        let mut path_and_query = String::with_capacity(self.base_path.len() + path.len() + 16);
        path_and_query.push_str(&self.base_path);
        if !path.starts_with('/') {
            path_and_query.push('/');
        }
        path_and_query.push_str(path);

        match (self.base_query.as_deref(), inbound.query()) {
            (Some(base), Some(query)) => {
                path_and_query.push('?');
                path_and_query.push_str(base);
                path_and_query.push('&');
                path_and_query.push_str(query);
            }
            (Some(query), None) | (None, Some(query)) => {
                path_and_query.push('?');
                path_and_query.push_str(query);
            }
            (None, None) => {}
        }

        let path_and_query = PathAndQuery::try_from(path_and_query)
            .map_err(|e| ForwardError::InvalidUri(e.to_string()))?;

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ForwardError::InvalidUri(e.to_string()))
    }

    async fn forward(
        &self,
        req: Request<ReqBody>,
    ) -> std::result::Result<Response<RespBody>, ForwardError> {
        let (mut parts, body) = req.into_parts();

        parts.uri = self.upstream_uri(&parts.uri)?;
        // The pooled client speaks HTTP/1.1 to the upstream.
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        let host = HeaderValue::from_str(self.authority.as_str())
            .map_err(|e| ForwardError::InvalidUri(e.to_string()))?;
        parts.headers.insert(header::HOST, host);

        if let Some(peer) = parts.extensions.get::<RemoteAddr>().copied() {
            append_forwarded_for(&mut parts.headers, &peer);
        }

        trace!(uri = %parts.uri, "Forwarding request upstream");

        let resp = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        let (mut parts, body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn handle(&self, req: Request<ReqBody>) -> Response<RespBody> {
        match self.forward(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, upstream = %self.authority, "Forwarding failed");
                let status = StatusCode::from(&e);
                text_response(status, status.canonical_reason().unwrap_or("Bad Gateway"))
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Append the peer address to `X-Forwarded-For`.
fn append_forwarded_for(headers: &mut HeaderMap, peer: &RemoteAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

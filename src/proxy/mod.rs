//! HTTP handler chain and reverse proxy server.

mod middleware;
mod server;
mod service;

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

pub use middleware::{Recover, RequestLog};
pub use server::ProxyServer;
pub use service::{ForwardError, ReverseProxy};

/// Body type of requests flowing through the handler chain.
pub type ReqBody = BoxBody<Bytes, hyper::Error>;
/// Body type of responses produced by the handler chain.
pub type RespBody = BoxBody<Bytes, hyper::Error>;

/// Peer address of the connection a request arrived on.
///
/// Inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

impl RemoteAddr {
    /// IP part of the peer address.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }
}

/// A step in the request handling chain.
///
/// Every handler produces exactly one response per request; middleware
/// handlers decide whether to call the next handler at all.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle a request.
    async fn handle(&self, req: Request<ReqBody>) -> Response<RespBody>;
}

/// Wrap a fixed byte string as a response body.
pub fn full_body(data: impl Into<Bytes>) -> RespBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Build a plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<RespBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

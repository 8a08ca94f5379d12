//! Generic middleware handlers wrapping the rest of the chain.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use http::{Request, Response, StatusCode};
use tracing::{error, info};

use super::{text_response, Handler, RemoteAddr, ReqBody, RespBody};

/// Turns a panic anywhere further down the chain into a `500` response.
pub struct Recover {
    next: Arc<dyn Handler>,
}

impl Recover {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for Recover {
    async fn handle(&self, req: Request<ReqBody>) -> Response<RespBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match AssertUnwindSafe(self.next.handle(req)).catch_unwind().await {
            Ok(resp) => resp,
            Err(panic) => {
                error!(
                    method = %method,
                    path = %path,
                    panic = %panic_message(&*panic),
                    "Handler panicked"
                );
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Writes one access log line per request.
pub struct RequestLog {
    next: Arc<dyn Handler>,
}

impl RequestLog {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for RequestLog {
    async fn handle(&self, req: Request<ReqBody>) -> Response<RespBody> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let version = req.version();
        let peer = req.extensions().get::<RemoteAddr>().map(|addr| addr.0);

        let resp = self.next.handle(req).await;

        info!(
            method = %method,
            path = %path,
            version = ?version,
            peer = ?peer,
            status = resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Request completed"
        );
        resp
    }
}

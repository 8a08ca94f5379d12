//! HTTP server running the rate-limited proxy chain.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{Handler, Recover, RemoteAddr, RequestLog, ReverseProxy};
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// How long in-flight connections may take to finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// HTTP server for the rate-limited reverse proxy.
pub struct ProxyServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Head of the handler chain
    handler: Arc<dyn Handler>,
}

impl ProxyServer {
    /// Create a server running `Recover → RateLimited → RequestLog → ReverseProxy`.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, proxy: ReverseProxy) -> Self {
        let proxy: Arc<dyn Handler> = Arc::new(proxy);
        let logged: Arc<dyn Handler> = Arc::new(RequestLog::new(proxy));
        let limited: Arc<dyn Handler> = Arc::new(rate_limiter.layer(logged));
        Self::with_handler(addr, Arc::new(Recover::new(limited)))
    }

    /// Create a server running an arbitrary handler chain.
    pub fn with_handler(addr: SocketAddr, handler: Arc<dyn Handler>) -> Self {
        Self { addr, handler }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves, then waits for in-flight connections to finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.run(listener, signal).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        let builder = ConnBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        tokio::pin!(signal);

        info!(addr = %local_addr, "Starting rate-limited proxy");

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept error");
                            continue;
                        }
                    };

                    let handler = self.handler.clone();
                    let service = service_fn(move |mut req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move {
                            req.extensions_mut().insert(RemoteAddr(peer));
                            let req = req.map(|body| body.boxed());
                            Ok::<_, Infallible>(handler.handle(req).await)
                        }
                    });

                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn.into_owned());
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }

        drop(listener);

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections closed");
            }
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!(grace = ?SHUTDOWN_GRACE, "Timed out waiting for connections to close");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Response, StatusCode};
    use http_body_util::Full;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::client::legacy::Client;
    use tokio::sync::oneshot;

    /// Spawn a plain upstream that echoes the request path and Host header.
    async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let host = req
                            .headers()
                            .get(http::header::HOST)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = format!("{} {}", req.uri().path(), host);
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let rate_limiter = Arc::new(RateLimiter::limit_all(10, Duration::from_secs(60)).unwrap());
        let proxy = ReverseProxy::new("http://127.0.0.1:3000").unwrap();
        let _server = ProxyServer::new(addr, rate_limiter, proxy);
    }

    #[tokio::test]
    async fn test_proxy_forwards_and_limits() {
        let upstream = spawn_upstream().await;
        let proxy = ReverseProxy::new(&format!("http://{}", upstream)).unwrap();
        let rate_limiter =
            Arc::new(RateLimiter::limit_by_ip(2, Duration::from_secs(3600)).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let server = ProxyServer::new(proxy_addr, rate_limiter, proxy);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(listener, async move {
            let _ = shutdown_rx.await;
        }));

        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let uri: http::Uri = format!("http://{}/hello", proxy_addr).parse().unwrap();

        for expected_remaining in ["1", "0"] {
            let resp = client.get(uri.clone()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()["x-ratelimit-limit"], "2");
            assert_eq!(resp.headers()["x-ratelimit-remaining"], expected_remaining);
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, Bytes::from(format!("/hello {}", upstream)));
        }

        let resp = client.get(uri).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));

        shutdown_tx.send(()).unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_binds_and_stops() {
        struct Teapot;

        #[async_trait::async_trait]
        impl Handler for Teapot {
            async fn handle(
                &self,
                _req: Request<crate::proxy::ReqBody>,
            ) -> http::Response<crate::proxy::RespBody> {
                crate::proxy::text_response(StatusCode::IM_A_TEAPOT, "short and stout")
            }
        }

        // Reserve a free port, then let the server bind it itself.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let server = ProxyServer::with_handler(addr, Arc::new(Teapot));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = shutdown_rx.await;
        }));

        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let uri: http::Uri = format!("http://{}/", addr).parse().unwrap();

        let mut resp = client.get(uri.clone()).await;
        for _ in 0..50 {
            if resp.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            resp = client.get(uri.clone()).await;
        }
        assert_eq!(resp.unwrap().status(), StatusCode::IM_A_TEAPOT);

        shutdown_tx.send(()).unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Bind and drop to get a port with nothing listening.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let proxy = ReverseProxy::new(&format!("http://{}", dead_addr)).unwrap();
        let rate_limiter = Arc::new(RateLimiter::limit_all(10, Duration::from_secs(60)).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let server = ProxyServer::new(proxy_addr, rate_limiter, proxy);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(listener, async move {
            let _ = shutdown_rx.await;
        }));

        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let uri: http::Uri = format!("http://{}/", proxy_addr).parse().unwrap();
        let resp = client.get(uri).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        shutdown_tx.send(()).unwrap();
        drop(client);
        server_task.await.unwrap().unwrap();
    }
}

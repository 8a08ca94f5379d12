use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::SlidegateConfig;
use slidegate::proxy::{ProxyServer, ReverseProxy};
use slidegate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Rate-limiting reverse proxy.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Upstream base URL to forward requests to
    #[arg(long, visible_alias = "upstream", value_name = "URL")]
    host: Option<String>,

    /// Maximum requests per client per window
    #[arg(long)]
    limit: Option<u64>,

    /// Window length in seconds
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut SlidegateConfig) {
        if let Some(host) = &self.host {
            config.server.upstream = Some(host.clone());
        }
        if let Some(limit) = self.limit {
            config.rate_limiting.request_limit = limit;
        }
        if let Some(interval) = self.interval {
            config.rate_limiting.window_secs = interval;
        }
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Slidegate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        SlidegateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let upstream = config.server.upstream.as_deref().unwrap_or_default();
    let proxy = ReverseProxy::new(upstream).context("Failed to parse upstream URL")?;

    let rate_limiting = &config.rate_limiting;
    let rate_limiter = RateLimiter::builder(rate_limiting.request_limit, rate_limiting.window_length())
        .key_by(rate_limiting.key_derivers())
        .response_headers(rate_limiting.headers.clone())
        .build()
        .context("Failed to build rate limiter")?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %upstream,
        limit = rate_limiting.request_limit,
        window_secs = rate_limiting.window_secs,
        key_by = ?rate_limiting.key_by,
        "Configuration loaded"
    );

    let server = ProxyServer::new(config.server.listen_addr, Arc::new(rate_limiter), proxy);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Slidegate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

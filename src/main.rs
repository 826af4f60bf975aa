use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waf_proxy::config::Config;
use waf_proxy::waf::rate_limiter::BUCKET_IDLE_TTL;
use waf_proxy::ReverseProxy;

/// Exit code for configuration-fatal failures (rule compile errors,
/// malformed CIDRs, duplicate rule ids).
const EXIT_CONFIG_FATAL: u8 = 2;
const EXIT_RUNTIME_FAILURE: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "waf-proxy")]
#[command(about = "A reverse-proxy web application firewall")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_FATAL);
        }
    };

    if args.validate_config {
        // Rule compilation is part of validation; exercise it too.
        if let Err(e) = ReverseProxy::new(&config) {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_FATAL);
        }
        info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let proxy = match ReverseProxy::new(&config) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) if e.is_config_fatal() => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_FATAL);
        }
        Err(e) => {
            error!("startup error: {e}");
            return ExitCode::from(EXIT_RUNTIME_FAILURE);
        }
    };

    info!("waf-proxy starting");

    // Sweep idle rate-limit buckets so memory stays bounded.
    let limiter = proxy.rate_limiter();
    let reaper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            limiter.reap_idle(BUCKET_IDLE_TTL);
        }
    });

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to listen for shutdown signal");
        }
        info!("received shutdown signal");
    };

    let result = proxy.serve(&config.server, shutdown).await;
    reaper.abort();

    match result {
        Ok(()) => {
            info!("waf-proxy shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server error: {e}");
            ExitCode::from(EXIT_RUNTIME_FAILURE)
        }
    }
}

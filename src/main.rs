use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice::config::{FailMode, LimiterConfig};
use sluice::http::{AppState, HttpServer};
use sluice::ratelimit::{build_algorithm, RateLimitAlgorithm, RateLimiter, RuleResolver, RuleSet};
use sluice::store::{CircuitBreaker, RedisStore};
use sluice::telemetry::Metrics;

/// Sluice - distributed rate limiting service
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the service configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// HTTP listen address
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Path to the rate limit rules file
    #[arg(long = "rules")]
    rules: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting Sluice Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration with CLI overrides
    let mut config = LimiterConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.listen_addr = addr.parse()?;
    }
    if let Some(rules) = args.rules {
        config.rate_limiting.rules_path = Some(rules);
    }

    info!(
        listen_addr = %config.server.listen_addr,
        algorithm = %config.rate_limiting.algorithm,
        fail_mode = %config.rate_limiting.fail_mode,
        "Configuration loaded"
    );

    // Load rate limit rules
    let resolver = Arc::new(RuleResolver::new(load_rules(&config)));

    // Connect to the backing store. With fail-mode open the service starts
    // even when the store is down and admits requests until it recovers.
    let store = Arc::new(RedisStore::new(&config.store)?);
    match store.ping().await {
        Ok(()) => info!(
            host = %config.store.host,
            port = config.store.port,
            "Connected to backing store"
        ),
        Err(e) => {
            if config.rate_limiting.fail_mode == FailMode::Closed {
                anyhow::bail!("backing store unreachable and fail mode is closed: {e}");
            }
            warn!(error = %e, "Backing store unreachable at startup; failing open");
        }
    }

    // Wire telemetry and the circuit breaker
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(Metrics::new(&registry)?);
    let breaker_metrics = metrics.clone();
    let breaker = Arc::new(
        CircuitBreaker::new(config.breaker.failure_threshold, config.breaker.cooldown())
            .with_transition_hook(move |state| breaker_metrics.record_breaker_transition(state)),
    );

    // Build the configured admission algorithm
    let algorithm = build_algorithm(config.rate_limiting.algorithm, store.clone());
    if let Err(e) = algorithm.register().await {
        warn!(error = %e, "Script registration deferred to first use");
    }

    let limiter = Arc::new(RateLimiter::new(
        algorithm,
        resolver.clone(),
        breaker.clone(),
        config.rate_limiting.fail_mode,
        metrics,
    ));

    let state = AppState {
        limiter,
        store,
        breaker,
        rules: resolver,
        registry,
        service_name: config.server.service_name.clone(),
    };

    let server = HttpServer::new(config.server.listen_addr, state);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Sluice Rate Limiting Service stopped");
    Ok(())
}

/// Load rate limit rules from the configured file path.
fn load_rules(config: &LimiterConfig) -> RuleSet {
    if let Some(ref path) = config.rate_limiting.rules_path {
        match RuleSet::from_file(path) {
            Ok(rules) => {
                info!(
                    path = %path,
                    client_count = rules.clients.len(),
                    "Rate limit rules loaded"
                );
                return rules;
            }
            Err(e) => {
                warn!(
                    path = %path,
                    error = %e,
                    "Failed to load rules file, using built-in rules"
                );
            }
        }
    }
    RuleSet::default()
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

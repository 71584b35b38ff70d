/* src/server.rs */

use crate::auth::AuthVerifier;
use crate::balancer::Balancer;
use crate::breaker::{BreakerParams, BreakerStore};
use crate::config::{self, AppConfig};
use crate::metrics::Metrics;
use crate::models::RegistryMode;
use crate::ratelimit::RateLimiterStore;
use crate::registry::{self, Registry};
use crate::routing::RouteTable;
use crate::state::AppState;
use crate::{middleware, proxy, setup};
use anyhow::{Context, Result, bail};
use arc_swap::ArcSwap;
use axum::Router;
use fancy_log::{LogLevel, log};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

/// Loads configuration, builds the shared state, and runs the gateway.
pub async fn run() -> Result<()> {
    let app_config = match config::load_config() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            log(
                LogLevel::Error,
                &format!("Failed to load configuration: {}", e),
            );
            std::process::exit(1);
        }
    };

    if app_config.main.routes.is_empty() {
        return setup::handle_first_run().await;
    }

    let state = build_shared_state(app_config.clone())?;

    let _refresher = registry::spawn_refresher(
        state.registry.clone(),
        app_config.main.registry.clone(),
    );
    spawn_reload_task(state.clone());

    let router = Router::new()
        .fallback(proxy::proxy_handler)
        .layer(axum::middleware::from_fn(middleware::log_requests))
        .with_state(state.clone());

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], app_config.port));
    let listener = TcpListener::bind(bind_addr).await?;
    log(
        LogLevel::Info,
        &format!(
            "Rudder gateway listening on http://localhost:{} ({} routes)",
            app_config.port,
            state.routes.load().len()
        ),
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Builds the shared AppState: compiled route table, registry, resilience
/// stores, and the upstream HTTP client. Any error here is fatal; the
/// gateway never serves with a partial table.
pub fn build_shared_state(app_config: Arc<AppConfig>) -> Result<Arc<AppState>> {
    let table = RouteTable::compile(&app_config.main.routes, &app_config.main.defaults)
        .context("Route table compilation failed")?;

    let auth = build_auth_verifier(&app_config)?;

    let registry = match app_config.main.registry.mode {
        RegistryMode::Static => Arc::new(Registry::from_static(
            &app_config.main.services,
            app_config.main.registry.miss_threshold,
        )),
        RegistryMode::Http => Arc::new(Registry::new(app_config.main.registry.miss_threshold)),
    };

    let metrics = Arc::new(Metrics::new());

    // rustls requires a process-level crypto provider before any
    // ClientConfig is built; a second install attempt reports the existing
    // one, which is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);
    let https_connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http_connector);
    let http_client =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::tokio::TokioExecutor::new())
            .build(https_connector);

    Ok(Arc::new(AppState {
        breaker_params: BreakerParams::from(&app_config.main.defaults.breaker),
        breakers: BreakerStore::new(metrics.clone()),
        routes: ArcSwap::from_pointee(table),
        registry,
        balancer: Balancer::new(),
        limiter: RateLimiterStore::new(),
        auth,
        metrics,
        http_client,
        config: app_config,
    }))
}

/// Authenticated routes need both the JWT secret and the signature secret;
/// refusing to start beats serving routes that can never authorize anyone.
fn build_auth_verifier(app_config: &AppConfig) -> Result<Option<AuthVerifier>> {
    let has_auth_routes = app_config.main.routes.iter().any(|r| r.auth);
    if !has_auth_routes {
        return Ok(None);
    }

    let jwt_secret = match &app_config.jwt_base64_secret {
        Some(secret) => secret,
        None => bail!("Authenticated routes are configured but JWT_BASE64_SECRET is not set"),
    };
    let signature_secret = match &app_config.signature_secret {
        Some(secret) => secret.clone(),
        None => bail!("Authenticated routes are configured but GATEWAY_SIGNATURE_SECRET is not set"),
    };

    Ok(Some(AuthVerifier::new(jwt_secret, signature_secret)?))
}

/// Swaps in a freshly compiled route table on SIGHUP. A config that fails
/// to load or compile leaves the current snapshot serving.
fn spawn_reload_task(state: Arc<AppState>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                log(
                    LogLevel::Error,
                    &format!("Failed to install reload signal handler: {}", e),
                );
                return;
            }
        };

        while hangup.recv().await.is_some() {
            log(LogLevel::Info, "Reload signal received, re-reading routes.");
            let reloaded = config::load_config().and_then(|cfg| {
                RouteTable::compile(&cfg.main.routes, &cfg.main.defaults)
            });
            match reloaded {
                Ok(table) if !table.is_empty() => {
                    let count = table.len();
                    state.routes.store(Arc::new(table));
                    log(
                        LogLevel::Info,
                        &format!("Route table reloaded ({} routes).", count),
                    );
                }
                Ok(_) => log(
                    LogLevel::Warn,
                    "Reloaded config has no routes; keeping the previous table.",
                ),
                Err(e) => log(
                    LogLevel::Error,
                    &format!("Reload failed, keeping the previous table: {}", e),
                ),
            }
        }
    });

    #[cfg(not(unix))]
    let _ = state;
}

/// Listens for OS signals for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log(LogLevel::Info, "Signal received, shutting down gracefully.");
}

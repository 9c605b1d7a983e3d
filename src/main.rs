use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use svcgate::acme::{self, AcmeManager, AcmeSettings, CertResolver};
use svcgate::admin::{DebugServer, PKG_NAME, VERSION};
use svcgate::cache::CertCache;
use svcgate::config::{resolve_config_path, Config, LogFormat, LoggerConfig};
use svcgate::middleware::{build_chain, Handler};
use svcgate::pool::ConnectionPool;
use svcgate::proxy::ProxyServer;
use svcgate::router::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ACME's HTTPS client builds its TLS config from the process-wide provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = resolve_config_path(std::env::args().nth(1), std::env::var("CONFIG_PATH").ok());

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("Failed to load configuration from {}: {:#}", config_path.display(), e);
        e
    })?;

    init_logging(&config.logger);
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Registry::new();

    let pool = Arc::new(
        ConnectionPool::new(config.listener.backend.pool_config(), &registry).map_err(|e| {
            error!(error = %e, "Failed to register backend pool metrics");
            e
        })?,
    );
    let router = Router::from_services(
        &config.services,
        Arc::clone(&pool),
        config.listener.backend.request_timeout(),
    );
    if router.is_empty() {
        warn!("No routes configured, every request will be answered with 404");
    }
    let hostnames = router.hostnames();
    info!(route_count = router.len(), hostnames = ?hostnames, "Routes initialized");

    let handler: Arc<dyn Handler> = build_chain(Arc::new(router), &config.listener.middlewares, &registry)
        .map_err(|e| {
            error!(error = %e, "Failed to build middleware chain");
            e
        })?;

    let cache_config = &config.autocert.cache;
    let cache = Arc::new(
        CertCache::from_options(&cache_config.backend, &cache_config.options)
            .await
            .map_err(|e| {
                error!(backend = %cache_config.backend, error = %e, "Failed to initialize certificate cache");
                e
            })?,
    );

    // Serve a self-signed certificate until ACME delivers a real one
    let resolver = Arc::new(CertResolver::new(Some(acme::self_signed_cert(&hostnames)?)));
    let acme_manager = Arc::new(AcmeManager::new(
        AcmeSettings {
            hosts: hostnames,
            email: config.autocert.email.clone(),
            directory_url: config.autocert.directory_url.clone(),
            renew_before_days: config.autocert.renew_before_days,
        },
        cache,
        Arc::clone(&resolver),
    ));
    let tls_acceptor = TlsAcceptor::from(Arc::new(acme::server_config(resolver)?));

    let http_addr = config.listener.http_socket()?;
    let https_addr = config.listener.https_socket()?;

    let http_proxy = ProxyServer::new(http_addr, Arc::clone(&handler), shutdown_rx.clone())
        .with_acme_challenges(acme_manager.http01_challenges());
    let http_handle = spawn_server("HTTP", http_addr, http_proxy.run());

    let https_proxy = ProxyServer::new(https_addr, Arc::clone(&handler), shutdown_rx.clone()).with_tls(tls_acceptor);
    let https_handle = spawn_server("HTTPS", https_addr, https_proxy.run());

    let debug_handle = match config.listener.debug_socket()? {
        Some(addr) => {
            let server = DebugServer::new(addr, registry.clone(), shutdown_rx.clone());
            Some(spawn_server("debug", addr, server.run()))
        }
        None => {
            info!("Debug listener disabled");
            None
        }
    };

    let acme_task = {
        let manager = Arc::clone(&acme_manager);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    acme_task.abort();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        let _ = https_handle.await;
        if let Some(handle) = debug_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(logger: &LoggerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logger.level.as_directive()));

    match logger.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn spawn_server<F>(name: &'static str, addr: SocketAddr, server: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(listener = name, addr = %addr, error = %e, "Listener error");
        }
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        http_addr = %config.listener.http_addr,
        https_addr = %config.listener.https_addr,
        debug_addr = %config.listener.debug_addr,
        middlewares = ?config.listener.middlewares.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        "Listener configuration"
    );
    info!(
        request_timeout_secs = config.listener.backend.request_timeout_secs,
        connect_timeout_secs = config.listener.backend.connect_timeout_secs,
        pool_max_idle = config.listener.backend.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.listener.backend.pool_idle_timeout_secs,
        "Backend transport settings"
    );
    info!(
        directory = %config.autocert.directory_url,
        email = ?config.autocert.email,
        cache_backend = %config.autocert.cache.backend,
        renew_before_days = config.autocert.renew_before_days,
        "ACME settings"
    );
}

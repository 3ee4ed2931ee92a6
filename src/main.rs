mod config;
mod engine;
mod handlers;
mod health;
mod metrics;
mod mutations;
mod pattern;
mod rules;
mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "k8s-steward", version, about = "Kubernetes mutating admission webhook")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/steward/config.yaml", env = "STEWARD_CONFIG")]
    config: String,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_https_server(
    addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    router: Router,
    ready: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind HTTPS on {addr}: {e}"));

    info!(%addr, "HTTPS webhook server listening");
    ready.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_http_server(addr: SocketAddr, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind HTTP on {addr}: {e}"));

    info!(%addr, "HTTP metrics/health server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let config = config::StewardConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        rules_file = %config.rules_file,
        ignore_namespaces = ?config.ignore_namespaces,
        accept_node_selectors = ?config.accept_node_selectors,
        debug = config.debug,
        "k8s-steward starting"
    );

    let rules = rules::RuleSet::load_file(&config.rules_file).unwrap_or_else(|e| {
        error!(rules_file = %config.rules_file, "failed to load rules: {e}");
        std::process::exit(1);
    });
    info!(
        restrict_tolerations = rules.restrict_tolerations.len(),
        place_pods = rules.place_pods.len(),
        resources = rules.resources.len(),
        disable_daemonsets = rules.disable_daemonsets.len(),
        namespaces_add_labels = rules.namespaces_add_labels.len(),
        "rules loaded"
    );

    let tls_config = tls::server_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| {
            error!("failed to load TLS config: {e}");
            std::process::exit(1);
        });
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let mut registry = Registry::default();
    let steward_metrics = metrics::StewardMetrics::new(&mut registry, &rules);
    let registry = Arc::new(registry);

    let engine = engine::MutationEngine::new(
        rules,
        config.ignore_namespaces.clone(),
        config.accept_node_selectors.clone(),
    );

    let app_state = Arc::new(handlers::AppState {
        engine,
        metrics: steward_metrics,
    });

    let webhook_router = Router::new()
        .route("/mutate", post(handlers::handle_mutate))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let health_router = health::router(Arc::new(health::HealthState {
        registry,
        ready: ready.clone(),
    }));

    let listen_addr: SocketAddr = config.listen_addr.parse().unwrap_or_else(|e| {
        error!("invalid listen_addr '{}': {e}", config.listen_addr);
        std::process::exit(1);
    });
    let metrics_addr: SocketAddr = config.metrics_addr.parse().unwrap_or_else(|e| {
        error!("invalid metrics_addr '{}': {e}", config.metrics_addr);
        std::process::exit(1);
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let https_shutdown_rx = shutdown_rx.clone();
    let http_shutdown_rx = shutdown_rx;

    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_https_server(
            listen_addr,
            tls_acceptor,
            webhook_router,
            ready,
            https_shutdown_rx
        ),
        run_http_server(metrics_addr, health_router, http_shutdown_rx),
    );

    info!("k8s-steward shut down gracefully");
}

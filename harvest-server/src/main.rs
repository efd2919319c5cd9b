use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use harvest_core::{cipher, snapshot, RetryPolicy};

mod config;
mod grpc;
mod http;
mod scheduler;

use config::ServerConfig;
use harvest_core::shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServerConfig::load()?;
    harvest_core::logging::init(&cfg.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "harvest server starting");

    let retry = RetryPolicy::default();
    let storage = harvest_core::storage::connect(cfg.database_dsn.as_deref(), &retry)
        .await
        .context("connect storage backend")?;

    if cfg.restore {
        if let Some(path) = &cfg.file_storage_path {
            if let Some(list) = snapshot::load(path).await.context("load snapshot")? {
                if !list.is_empty() {
                    let count = list.len();
                    storage.replace_all(list).await.context("restore snapshot")?;
                    info!(path = %path.display(), metrics = count, "snapshot restored");
                }
            }
        }
    }

    let private_key = match &cfg.crypto_key {
        Some(path) => {
            Some(Arc::new(cipher::load_private_key(path).await.context("load private key")?))
        }
        None => None,
    };
    let key: Option<Arc<str>> = cfg.key.as_deref().map(Arc::from);

    let flusher = Arc::new(scheduler::Flusher::new(
        storage.clone(),
        cfg.file_storage_path.clone(),
        cfg.store_interval,
    ));

    let shutdown_rx = shutdown::shutdown_signal();

    let scheduler_handle = (cfg.store_interval > 0).then(|| {
        tokio::spawn(scheduler::run(
            flusher.clone(),
            cfg.store_interval,
            shutdown_rx.resubscribe(),
        ))
    });

    let app = http::router(
        http::AppState { storage: storage.clone(), flusher: flusher.clone() },
        http::MiddlewareState {
            trusted_subnet: cfg.trusted_subnet,
            private_key,
            key: key.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(&cfg.address)
        .await
        .with_context(|| format!("bind {}", cfg.address))?;
    info!(address = %cfg.address, "HTTP listener started");

    let mut http_shutdown = shutdown_rx.resubscribe();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    });

    let grpc_addr = grpc_address(&cfg.address).await?;
    let mut grpc_handle = tokio::spawn(grpc::serve(
        grpc_addr,
        storage.clone(),
        flusher.clone(),
        key,
        cfg.trusted_subnet,
        shutdown_rx.resubscribe(),
    ));

    // Biased so a listener finishing right as the signal lands still takes
    // the graceful path.
    let mut stop = shutdown_rx;
    tokio::select! {
        biased;

        _ = stop.recv() => {
            info!("shutting down");
            let drain = async {
                let _ = (&mut http_handle).await;
                let _ = (&mut grpc_handle).await;
            };
            if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
                warn!("graceful shutdown timed out, aborting listeners");
                http_handle.abort();
                grpc_handle.abort();
            }
        }
        res = &mut http_handle => {
            res.context("HTTP listener task")?.context("HTTP listener failed")?;
            anyhow::bail!("HTTP listener exited unexpectedly");
        }
        res = &mut grpc_handle => {
            res.context("gRPC listener task")?.context("gRPC listener failed")?;
            anyhow::bail!("gRPC listener exited unexpectedly");
        }
    }

    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }

    if let Err(err) = flusher.flush().await {
        warn!(error = %err, "final snapshot flush failed");
    }

    info!("harvest server stopped");
    Ok(())
}

/// The gRPC listener binds the HTTP host at port + 1.
async fn grpc_address(address: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = address.rsplit_once(':').context("address is missing a port")?;
    let port: u16 = port.parse().with_context(|| format!("bad port in {address}"))?;
    let target = format!("{host}:{}", port + 1);

    tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("resolve {target}"))?
        .next()
        .with_context(|| format!("no address for {target}"))
}

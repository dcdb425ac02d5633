//! Server lifecycle: open the engine, start listeners and background jobs,
//! wait for Ctrl-C, then stop everything and flush.

use std::io;
use std::sync::Arc;

use rrdb::{Engine, RrdbError};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::{tasks, tcp, udp};

/// Errors that stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The engine failed to open or to flush on shutdown.
    #[error(transparent)]
    Engine(#[from] RrdbError),

    /// A listener could not bind its address.
    #[error("failed to bind {protocol} listener on {address}: {source}")]
    Bind {
        /// `TCP` or `UDP`.
        protocol: &'static str,
        /// The configured address and port.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Waiting for the shutdown signal failed.
    #[error("failed to wait for the shutdown signal: {0}")]
    Signal(#[source] io::Error),

    /// A blocking engine call panicked.
    #[error("engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs the server until Ctrl-C.
///
/// # Errors
///
/// Returns [`ServerError`] if the engine cannot be opened, a listener cannot
/// bind, or the final flush fails.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let path = config.storage.path.clone();
    let options = config.registry_options();
    let engine = Arc::new(tokio::task::spawn_blocking(move || Engine::open(path, options)).await??);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    if config.server_tcp.port == 0 {
        tracing::info!("TCP listener disabled");
    } else {
        let address = format!("{}:{}", config.server_tcp.address, config.server_tcp.port);
        let listener = TcpListener::bind(&address).await.map_err(|source| ServerError::Bind {
            protocol: "TCP",
            address: address.clone(),
            source,
        })?;
        tracing::info!("TCP listener on {address}");
        let limits = tcp::Limits {
            max_message_size: config.server_tcp.max_message_size,
            read_timeout: config.server_tcp.read_timeout.to_std(),
        };
        workers.spawn(tcp::serve(listener, Arc::clone(&engine), limits, shutdown_rx.clone()));
    }

    if config.server_udp.port == 0 {
        tracing::info!("UDP listener disabled");
    } else {
        let address = format!("{}:{}", config.server_udp.address, config.server_udp.port);
        let socket = UdpSocket::bind(&address).await.map_err(|source| ServerError::Bind {
            protocol: "UDP",
            address: address.clone(),
            source,
        })?;
        tracing::info!("UDP listener on {address}");
        workers.spawn(udp::serve(
            socket,
            Arc::clone(&engine),
            config.server_udp.max_message_size,
            shutdown_rx.clone(),
        ));
    }

    workers.spawn(tasks::flush_periodically(
        Arc::clone(&engine),
        config.storage.flush_interval.to_std(),
        shutdown_rx.clone(),
    ));
    workers.spawn(tasks::record_status_periodically(
        Arc::clone(&engine),
        config.server.status_update_interval.to_std(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.map_err(ServerError::Signal)?;
    tracing::info!("shutting down");

    // Receivers may already be gone if a task exited early.
    let _ = shutdown_tx.send(true);
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::warn!("task failed during shutdown: {e}");
        }
    }

    let metrics = engine.registry().len();
    tokio::task::spawn_blocking(move || engine.flush()).await??;
    tracing::info!("flushed {metrics} metrics, bye");
    Ok(())
}

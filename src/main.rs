// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_coordinator::api::router;
use relay_coordinator::chain::{AlloyChainClient, ChainError};
use relay_coordinator::config::{Config, ConfigError, RPC_URL_ENV, SIGNER_PRIVATE_KEY_ENV};
use relay_coordinator::dequeue::{
    CallbackDispatcher, CallbackRegistry, DequeueConfig, DequeueEngine, RetryPolicy,
};
use relay_coordinator::events::EventBus;
use relay_coordinator::logging;
use relay_coordinator::mutex::{server, LockClient, LockServer};
use relay_coordinator::state::AppState;
use relay_coordinator::storage::{Store, StoreError};
use relay_coordinator::supervisor::Supervisor;
use relay_coordinator::workflow::WorkflowEngine;

#[derive(Debug, thiserror::Error)]
enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BootError {
    let context = context.into();
    move |source| BootError::Io { context, source }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), BootError> {
    info!(
        worker_index = config.worker_index,
        worker_count = config.worker_count,
        "Starting relay worker"
    );

    std::fs::create_dir_all(&config.data_dir)
        .map_err(io_error(format!("creating {}", config.data_dir.display())))?;
    let store = Arc::new(Store::open(&config.database_path())?);

    let rpc_url = Config::require(&config.rpc_url, RPC_URL_ENV)?;
    let key = Config::require(&config.signer_private_key, SIGNER_PRIVATE_KEY_ENV)?;
    let chain = Arc::new(AlloyChainClient::new(
        rpc_url,
        AlloyChainClient::signer_from_hex(key)?,
    )?);

    let shutdown = CancellationToken::new();
    let events = EventBus::new();
    let supervisor = Arc::new(Supervisor::new(config.tick_interval, events.clone()));

    if config.hosts_lock_server() {
        let listener = TcpListener::bind(&config.lock_server_addr)
            .await
            .map_err(io_error(format!("binding lock server on {}", config.lock_server_addr)))?;
        tokio::spawn(server::serve(
            LockServer::new(config.lease_timeout),
            listener,
            shutdown.clone(),
        ));
    }
    let lock = Arc::new(LockClient::new(config.lock_server_addr.clone()));

    let dispatcher = Arc::new(
        CallbackDispatcher::new(Arc::new(CallbackRegistry::new()), RetryPolicy::default())
            .with_lock(Arc::clone(&lock)),
    );
    let dequeue = Arc::new(DequeueEngine::new(
        Arc::clone(&store),
        chain,
        dispatcher,
        events.clone(),
        DequeueConfig::from_config(&config),
    ));
    let workflow = Arc::new(WorkflowEngine::new(
        Arc::clone(&store),
        events,
        config.task_timeout_cadence,
    ));

    supervisor.register(dequeue.clone());
    supervisor.register(workflow.clone());
    tokio::spawn(Arc::clone(&supervisor).run(shutdown.clone()));

    // Resume jobs left behind by a previous run without waiting for the
    // first scheduled scan.
    {
        let dequeue = Arc::clone(&dequeue);
        tokio::spawn(async move {
            match dequeue.recover().await {
                Ok(report) => info!(?report, "Startup recovery finished"),
                Err(e) => warn!(error = %e, "Startup recovery failed"),
            }
        });
    }

    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(io_error(format!("binding admin server on {addr}")))?;
    info!(%addr, "Admin server listening");

    let app = router(AppState::new(dequeue, workflow, supervisor));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(io_error("admin server"))?;

    shutdown.cancel();
    lock.disconnect().await;
    info!("Relay worker stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for ctrl-c");
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

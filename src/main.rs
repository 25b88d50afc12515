/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! dns-upstream - a DNS forwarder built around health-checked upstream pools
//!
//! The binary loads one forwarding rule from YAML, builds its upstreams,
//! starts their health checks and serves UDP queries until Ctrl+C. On Unix a
//! SIGHUP rereads the file and swaps in the new upstream list.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::{runtime, signal};
use tracing::{error, info, warn};

mod config;
mod core;
mod forward;
mod network;
mod server;

use core::error::{DnsError, Result};
use core::runtime::Runtime;

/// Application entry point
fn main() -> Result<()> {
    let runtime = core::init();
    init_runtime(runtime)
}

/// Build the multi-threaded Tokio runtime and run the application on it
fn init_runtime(runtime: Runtime) -> Result<()> {
    let mut tokio_runtime = runtime::Builder::new_multi_thread();
    tokio_runtime
        .enable_all()
        .thread_name("dns-upstream-worker")
        .worker_threads(runtime.options.workers.max(1));
    let tokio_runtime = tokio_runtime
        .build()
        .map_err(|err| DnsError::runtime(format!("Failed to initialize Tokio runtime: {err}")))?;
    tokio_runtime.block_on(run_async_main(runtime))
}

/// Load configuration, start the forwarder and serve until Ctrl+C
async fn run_async_main(mut runtime: Runtime) -> Result<()> {
    let options = runtime.options.clone();

    let config = match config::init(&options.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }
    runtime.log_guard = Some(core::init_log(log_config));
    info!("Loaded configuration from: {:?}", options.config);

    network::tls_config::install_default_provider();

    let listen = options.listen.unwrap_or_else(|| config.listen.clone());
    let listen: SocketAddr = listen.parse()?;

    let forwarder = match forward::Forwarder::from_config(&config.forward) {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            error!("Forwarder initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    forwarder.start();

    let socket = match server::build_udp_socket(listen) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to bind {}: {}", listen, e);
            forwarder.stop();
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::run_udp_server(socket, forwarder.clone(), shutdown_rx));
    info!(
        tag = forwarder.tag(),
        policy = %forwarder.policy(),
        %listen,
        "dns-upstream started"
    );

    wait_for_shutdown(&options.config, &forwarder).await;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    let _ = shutdown_tx.send(true);
    let _ = server.await;
    forwarder.stop();
    info!("Graceful shutdown complete");
    Ok(())
}

/// Block until Ctrl+C, reloading upstreams on every SIGHUP meanwhile
async fn wait_for_shutdown(config_path: &Path, forwarder: &forward::Forwarder) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{self, SignalKind};

        match unix::signal(SignalKind::hangup()) {
            Ok(mut hangup) => loop {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl+C: {}", e);
                        }
                        return;
                    }
                    Some(()) = hangup.recv() => reload_upstreams(config_path, forwarder),
                }
            },
            Err(e) => warn!("Failed to listen for SIGHUP, reload disabled: {}", e),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
}

fn reload_upstreams(config_path: &Path, forwarder: &forward::Forwarder) {
    info!("Received SIGHUP, reloading upstreams from {:?}", config_path);
    match config::init(config_path).and_then(|cfg| forwarder.reload(&cfg.forward)) {
        Ok(()) => info!(tag = forwarder.tag(), "Upstreams reloaded"),
        Err(e) => error!("Reload failed, keeping current upstreams: {}", e),
    }
}

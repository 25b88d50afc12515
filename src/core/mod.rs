/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core services: errors, logging, command line and request context

use crate::config::types::LogConfig;
use crate::core::log::UpstreamLogFormatter;
use crate::core::runtime::{Options, Runtime};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod context;
pub mod error;
mod log;
pub mod runtime;

/// Parse the command line into the runtime container
pub fn init() -> Runtime {
    Runtime {
        options: Options::parse(),
        log_guard: None,
    }
}

/// Install the global tracing subscriber
///
/// Console output is always enabled; a non-blocking file writer is added
/// when `log.file` is configured. The returned guard must be kept alive so
/// buffered lines are flushed on shutdown.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let (file_writer, guard) = match log.file.as_deref().map(Path::new) {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "dns-upstream.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), guard)
        }
        None => (None, tracing_appender::non_blocking(std::io::sink()).1),
    };

    let console_layer = fmt::layer()
        .event_format(UpstreamLogFormatter {
            with_thread_name: true,
        })
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(UpstreamLogFormatter {
                with_thread_name: false,
            })
            .with_ansi(false)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

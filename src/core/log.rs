/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Log line formatter
//!
//! `<local time> <LEVEL> <target>:<line>[:span{fields}...]: <fields>`

use chrono::Local;
use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;

pub struct UpstreamLogFormatter {
    /// Emit the thread name after the level (useful with the multi-thread runtime)
    pub with_thread_name: bool,
}

impl<S, N> FormatEvent<S, N> for UpstreamLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "{} {:>5}",
            Local::now().format("%FT%T%.3f"),
            metadata.level()
        )?;

        if self.with_thread_name {
            let current = std::thread::current();
            write!(&mut writer, " [{}]", current.name().unwrap_or("-"))?;
        }

        write!(&mut writer, " {}", metadata.target())?;
        if let Some(line) = metadata.line() {
            write!(&mut writer, ":{line}")?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{fields}}}")?;
                }
            }
        }

        write!(writer, ": ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

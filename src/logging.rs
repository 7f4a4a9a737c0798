// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Log line layout.
//!
//! Every event is rendered as a single line:
//!
//! ```text
//! 2024-09-15 03:00:01 | INFO - parameter engine = mysql
//! ```
//!
//! Events emitted under the [`ACTION`] target announce a step that changes the
//! host. They are labeled `ACTION` instead of their level and preceded by a
//! blank line, so the steps of a run stand out from their details.

use chrono::Local;
use std::fmt::Result as FmtResult;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::Writer, writer::MakeWriterExt, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    EnvFilter,
};

/// Target that marks an event as a host-changing step.
pub const ACTION: &str = "action";

/// Timestamp layout of every log line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Single line event format with action markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> FmtResult {
        let metadata = event.metadata();
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        if metadata.target() == ACTION {
            write!(writer, "\n{timestamp} | ACTION - ")?;
        } else {
            write!(writer, "{timestamp} | {} - ", metadata.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install global subscriber using [`LineFormat`].
///
/// Warnings and errors go to standard error, everything else to standard
/// output. Verbosity follows `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);
    let layer = fmt::layer().event_format(LineFormat).with_writer(writer);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();
}

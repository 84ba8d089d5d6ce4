use std::fmt;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};

static INIT: Once = Once::new();

const FALLBACK_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// `YYYY-MM-DD HH:MM:SS | LEVEL | target | message`
    #[default]
    Pipe,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pipe" | "text" => Some(Self::Pipe),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Event formatter producing the pipe-delimited line layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeFormat;

fn timestamp(now: OffsetDateTime) -> Result<String, time::error::Format> {
    now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
}

impl<S, N> FormatEvent<S, N> for PipeFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let stamp = timestamp(OffsetDateTime::now_utc()).map_err(|_| fmt::Error)?;
        write!(
            writer,
            "{} | {} | {} | ",
            stamp,
            metadata.level(),
            metadata.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
}

/// Subscriber writing pipe-formatted lines to `writer`.
pub fn pipe_subscriber<W>(directives: &str, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(
            fmt_layer::layer()
                .with_ansi(false)
                .with_writer(writer)
                .event_format(PipeFormat),
        )
        .with(env_filter(directives))
}

/// Subscriber writing one JSON object per event to `writer`.
pub fn json_subscriber<W>(directives: &str, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(
            fmt_layer::layer()
                .json()
                .with_target(true)
                .with_writer(writer),
        )
        .with(env_filter(directives))
}

/// Install the process-wide subscriber, writing to stderr.
///
/// Only the first call in a process does anything; it returns `true` when it
/// installed the subscriber. Invalid filter directives fall back to `info`.
pub fn init_logging(directives: &str, format: LogFormat) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let result = match format {
            LogFormat::Pipe => pipe_subscriber(directives, std::io::stderr).try_init(),
            LogFormat::Json => json_subscriber(directives, std::io::stderr).try_init(),
        };
        installed = result.is_ok();
    });
    installed
}

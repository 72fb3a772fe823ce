//! Custom tracing formatter matching the daemon's log-file format:
//! `[YYYY-MM-DD HH:MM:SS] [LEVEL  ] message`.

use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

struct TaskmasterFormat;

impl<S, N> FormatEvent<S, N> for TaskmasterFormat
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
        let now = chrono::Local::now();
        let level_label = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARNING",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "DEBUG",
        };
        write!(
            writer,
            "[{}] [{:<7}] ",
            now.format("%Y-%m-%d %H:%M:%S"),
            level_label
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Maps the catalog's `loglevel` (0..3) to a tracing filter, overridable
/// by `RUST_LOG` for development.
fn level_filter(loglevel: u8) -> &'static str {
    match loglevel {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

pub fn init(loglevel: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(loglevel)));

    tracing_subscriber::fmt()
        .event_format(TaskmasterFormat)
        .with_env_filter(filter)
        .init();
}

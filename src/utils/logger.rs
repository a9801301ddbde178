//! Logging utilities for Norx
//!
//! This module installs the global `tracing` subscriber with the Norx event format.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Custom event formatter for Norx logs
pub struct NorxFormatter;

impl<S, N> FormatEvent<S, N> for NorxFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Format timestamp
        let now = chrono::Local::now();
        write!(writer, "[{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"))?;

        // Format level
        let level = *event.metadata().level();
        match level {
            Level::TRACE => write!(writer, "TRACE")?,
            Level::DEBUG => write!(writer, "DEBUG")?,
            Level::INFO => write!(writer, "INFO ")?,
            Level::WARN => write!(writer, "WARN ")?,
            Level::ERROR => write!(writer, "ERROR")?,
        }
        write!(writer, "] ")?;

        // Worker threads are named, the rest is noise
        if let Some(thread) = std::thread::current().name() {
            if thread != "main" && !thread.starts_with("tokio-runtime") {
                write!(writer, "<{}> ", thread)?;
            }
        }

        // Format module path
        if let Some(module_path) = event.metadata().module_path() {
            write!(writer, "[{}] ", module_path)?;
        }

        // Format fields
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Open a log file for appending
fn open_log_file(path: &str) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize the logging system. Events go to stderr and, when configured,
/// are appended to `log_file` as well.
pub fn init_logging(log_level: Level, log_file: Option<&str>) -> anyhow::Result<()> {
    let writer: BoxMakeWriter = match log_file {
        Some(path) => {
            let file: File = open_log_file(path).with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(writer)
        .event_format(NorxFormatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set global default subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_is_created_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norx.log");
        std::fs::write(&path, "existing\n").unwrap();

        let mut file: File = open_log_file(path.to_str().unwrap()).unwrap();
        std::io::Write::write_all(&mut file, b"appended\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing\nappended\n");
    }
}

//! Audit logging.
//!
//! Every record is rendered as `[YYYY-MM-DD HH:MM:SS][LEVEL] message` and
//! appended to the audit file. The same line goes to the console: WARN and
//! ERROR on stderr so the fleet agent's error capture sees them, INFO and
//! DEBUG on stdout. DEBUG is only enabled in verbose mode.

use policybanner_common::Timestamp;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Line format shared by the audit file and the console.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditFormat;

impl<S, N> FormatEvent<S, N> for AuditFormat
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
        write!(
            writer,
            "[{}][{}] ",
            Timestamp::now().to_log_format(),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Open the audit log for appending, creating it if needed.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Build the subscriber. `log_file` is `None` when the audit file could
/// not be opened; console output still works in that case.
pub fn subscriber(log_file: Option<File>, verbose: bool) -> impl Subscriber + Send + Sync {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let console = fmt::layer().event_format(AuditFormat).with_writer(
        std::io::stderr
            .with_max_level(Level::WARN)
            .or_else(std::io::stdout),
    );

    let audit = log_file.map(|file| {
        fmt::layer()
            .event_format(AuditFormat)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(console)
        .with(audit)
        .with(filter)
}

/// Install the process-wide subscriber. Returns `false` if the audit file
/// could not be opened and records only reach the console.
pub fn init(log_path: &Path, verbose: bool) -> bool {
    let (file, open_error) = match open_log_file(log_path) {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };

    subscriber(file, verbose).init();

    match open_error {
        Some(e) => {
            tracing::warn!(
                "Audit log {} unavailable, logging to console only: {}",
                log_path.display(),
                e
            );
            false
        }
        None => true,
    }
}

/// Append raw bytes (e.g. captured command output) to the audit log,
/// without a record prefix.
pub fn append_raw(log_path: &Path, content: &[u8]) -> io::Result<()> {
    if content.is_empty() {
        return Ok(());
    }

    let mut file = open_log_file(log_path)?;
    file.write_all(content)?;
    if !content.ends_with(b"\n") {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use tracing::{debug, error, info, warn};

    fn record_parts(line: &str) -> (&str, &str) {
        // "[2024-03-07 09:05:02][INFO] message"
        let level_start = line.find("][").expect("timestamp bracket") + 2;
        let level_end = level_start + line[level_start..].find(']').expect("level bracket");
        (&line[level_start..level_end], &line[level_end + 2..])
    }

    #[test]
    fn test_records_are_leveled_and_timestamped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let file = open_log_file(&path).unwrap();

        tracing::subscriber::with_default(subscriber(Some(file), false), || {
            info!("first");
            warn!("second");
            error!("third");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            assert!(line.starts_with('['));
            // timestamp is "YYYY-MM-DD HH:MM:SS"
            assert_eq!(line[1..].find(']'), Some(19));
        }
        assert_eq!(record_parts(lines[0]), ("INFO", "first"));
        assert_eq!(record_parts(lines[1]), ("WARN", "second"));
        assert_eq!(record_parts(lines[2]), ("ERROR", "third"));
    }

    #[test]
    fn test_debug_only_when_verbose() {
        let dir = tempdir().unwrap();
        let quiet = dir.path().join("quiet.log");
        let loud = dir.path().join("loud.log");

        let file = open_log_file(&quiet).unwrap();
        tracing::subscriber::with_default(subscriber(Some(file), false), || {
            debug!("hidden detail");
            info!("visible");
        });
        let file = open_log_file(&loud).unwrap();
        tracing::subscriber::with_default(subscriber(Some(file), true), || {
            debug!("hidden detail");
            info!("visible");
        });

        let quiet = std::fs::read_to_string(quiet).unwrap();
        let loud = std::fs::read_to_string(loud).unwrap();
        assert!(!quiet.contains("hidden detail"));
        assert!(loud.contains("[DEBUG] hidden detail"));
        assert!(loud.contains("[INFO] visible"));
    }

    #[test]
    fn test_log_is_appended_not_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "previous run\n").unwrap();

        let file = open_log_file(&path).unwrap();
        tracing::subscriber::with_default(subscriber(Some(file), false), || {
            info!("this run");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("previous run\n"));
        assert!(content.contains("[INFO] this run"));
    }

    #[test]
    fn test_append_raw_terminates_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");

        append_raw(&path, b"Started APFS operation").unwrap();
        append_raw(&path, b"").unwrap();
        append_raw(&path, b"Finished\n").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Started APFS operation\nFinished\n");
    }
}

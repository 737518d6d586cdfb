use flexi_logger::{DeferredNow, Logger, LoggerHandle, WriteMode};
use log::Record;
use std::io::Write;

/// Initializes the logger with custom formatting.
///
/// Log lines go to stderr so they never interleave with the target's own
/// output, which the session writes to stdout.
pub fn init_logger(spec: &str) -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let handle = Logger::try_with_str(spec)?
        .log_to_stderr()
        .write_mode(WriteMode::Direct)
        .format(log_format)
        .start()?;
    Ok(handle)
}

/// Custom log line format: timestamp, level, and message.
fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} [{:<5}] {}",
        now.format("%H:%M:%S%.3f"),
        record.level(),
        &record.args()
    )
}

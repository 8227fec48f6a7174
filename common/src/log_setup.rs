use std::path::Path;

use flexi_logger::writers::LogWriter;
use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger,
    LoggerHandle, Naming,
};

/// Starts the process-wide logger.
///
/// Records go to size-rotated files under `log_dir`, every record is duplicated to stdout and
/// warnings additionally to stderr. `RUST_LOG` overrides `base_level` when set. An optional
/// `extra` writer receives the same records, e.g. to forward them to connected viewers.
///
/// The returned handle must be kept alive for as long as logging is needed.
pub fn setup_logging(
    base_level: &str,
    log_dir: &Path,
    extra: Option<Box<dyn LogWriter>>,
) -> Result<LoggerHandle, FlexiLoggerError> {
    let file_spec = FileSpec::default().directory(log_dir);
    let logger = Logger::try_with_env_or_str(base_level)?;
    let logger = match extra {
        Some(writer) => logger.log_to_file_and_writer(file_spec, writer),
        None => logger.log_to_file(file_spec),
    };

    logger
        .format_for_files(detailed_format)
        .duplicate_to_stderr(Duplicate::Warn)
        .duplicate_to_stdout(Duplicate::All)
        .rotate(
            Criterion::Size(1024 * 1024), //1MB
            Naming::Timestamps,
            Cleanup::KeepLogFiles(5),
        )
        .start()
}

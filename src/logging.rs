// src/logging.rs

use crate::errors::{PalaverError, PalaverResult};
use crate::models::ApiCallLog;
use flexi_logger::{FileSpec, Logger, LoggerHandle};
use std::path::Path;

/// Starts file logging under `log_dir`. Keep the returned handle alive for the
/// lifetime of the program, dropping it flushes and stops the logger.
pub fn init_logging(level: &str, log_dir: &Path) -> PalaverResult<LoggerHandle> {
    Logger::try_with_str(level)
        .map_err(|e| PalaverError::config_error(format!("Invalid log level '{}': {}", level, e)))?
        .log_to_file(FileSpec::default().directory(log_dir).basename("palaver"))
        .format(flexi_logger::detailed_format)
        .start()
        .map_err(|e| PalaverError::config_error(format!("Failed to start logger: {}", e)))
}

/// Logs an API call on the `api` target.
pub fn log_api_call(log: &ApiCallLog) {
    log::info!(
        target: "api",
        "[{}] {} - {} - Status: {} - Time: {}ms",
        log.timestamp.to_rfc3339(),
        log.endpoint,
        log.request_summary,
        log.response_status,
        log.response_time_ms
    );
}

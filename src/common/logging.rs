//! Structured Logging for the Indexer
//!
//! Provides structured logging with:
//! - JSON output for log aggregation
//! - Correlation IDs for request tracing
//! - One target per concern, so operators can filter ingestion,
//!   confirmation, reconciliation, API and fault events independently
//!
//! # Usage
//!
//! ```rust,ignore
//! use nexxore_indexer::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?; // JSON mode for production
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// API request/response events
    Api,
    /// Range ingestion events
    Ingest,
    /// Confirmation and credit events
    Confirmation,
    /// Reconciliation reports
    Reconciliation,
    /// Ledger consistency faults and skipped units
    Fault,
    /// System events (startup, shutdown)
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Duration in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Add correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add duration
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Add error details
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Serialize this event to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Log one persisted range for a (chain, asset) pair
pub fn log_ingest_event(
    ledger_key: &str,
    from: u64,
    to: u64,
    inserted: usize,
    duplicates: usize,
    duration_ms: u64,
) {
    let event = LogEvent::new(
        LogLevel::Info,
        EventCategory::Ingest,
        format!("{} persisted [{}, {}]", ledger_key, from, to),
    )
    .with_duration(duration_ms)
    .with_data(serde_json::json!({
        "ledger_key": ledger_key,
        "from": from,
        "to": to,
        "inserted": inserted,
        "duplicates": duplicates,
    }));

    tracing::info!(target: "nexxore::ingest", "{}", event.to_json());
}

/// Log a downstream credit attempt
pub fn log_credit_event(
    ledger_key: &str,
    tx_id: &str,
    user: &str,
    amount: u128,
    success: bool,
    error: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Confirmation, "deposit_credited")
        .with_correlation_id(tx_id)
        .with_data(serde_json::json!({
            "ledger_key": ledger_key,
            "tx_id": tx_id,
            "user": user,
            "amount": amount.to_string(),
            "success": success,
        }));

    if let Some(err) = error {
        event = event.with_error("CREDIT_FAILED", err);
    }

    if success {
        tracing::info!(target: "nexxore::confirmation", "{}", event.to_json());
    } else {
        tracing::error!(target: "nexxore::confirmation", "{}", event.to_json());
    }
}

/// Log a reconciliation report; mismatches beyond tolerance are warnings
pub fn log_reconciliation_report(
    report_id: &str,
    ledger_key: &str,
    ledger_total: u128,
    chain_total: u128,
    drift: i128,
    within_tolerance: bool,
) {
    let level = if within_tolerance { LogLevel::Info } else { LogLevel::Warn };
    let message = if drift == 0 { "reconciliation_match" } else { "reconciliation_mismatch" };
    let event = LogEvent::new(level, EventCategory::Reconciliation, message)
        .with_correlation_id(report_id)
        .with_data(serde_json::json!({
            "ledger_key": ledger_key,
            "ledger_total": ledger_total.to_string(),
            "chain_total": chain_total.to_string(),
            "drift": drift.to_string(),
            "within_tolerance": within_tolerance,
        }));

    if within_tolerance {
        tracing::info!(target: "nexxore::reconcile", "{}", event.to_json());
    } else {
        tracing::warn!(target: "nexxore::reconcile", "{}", event.to_json());
    }
}

/// Log a fault: a skipped unit, a consistency violation or a failed pass
pub fn log_fault(ledger_key: &str, code: &str, message: &str) {
    let event = LogEvent::new(LogLevel::Warn, EventCategory::Fault, format!("{} fault", ledger_key))
        .with_error(code, message)
        .with_data(serde_json::json!({ "ledger_key": ledger_key }));

    tracing::warn!(target: "nexxore::fault", "{}", event.to_json());
}

/// Log an API request
pub fn log_api_request(method: &str, path: &str, client_ip: Option<&str>, correlation_id: &str) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Api, format!("{} {}", method, path))
        .with_correlation_id(correlation_id)
        .with_data(serde_json::json!({
            "method": method,
            "path": path,
            "client_ip": client_ip
        }));

    tracing::info!(target: "nexxore::api", "{}", event.to_json());
}

/// Log an API response
pub fn log_api_response(method: &str, path: &str, status: u16, duration_ms: u64, correlation_id: &str) {
    let level = if status >= 500 {
        LogLevel::Error
    } else if status >= 400 {
        LogLevel::Warn
    } else {
        LogLevel::Info
    };

    let event = LogEvent::new(level, EventCategory::Api, format!("{} {} -> {}", method, path, status))
        .with_correlation_id(correlation_id)
        .with_duration(duration_ms)
        .with_data(serde_json::json!({
            "method": method,
            "path": path,
            "status": status
        }));

    match level {
        LogLevel::Error => tracing::error!(target: "nexxore::api", "{}", event.to_json()),
        LogLevel::Warn => tracing::warn!(target: "nexxore::api", "{}", event.to_json()),
        _ => tracing::info!(target: "nexxore::api", "{}", event.to_json()),
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// Logs go to stderr; `RUST_LOG` overrides the level when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let level_name = format!("{:?}", level).to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nexxore={lvl},nexxore_indexer={lvl},tower_http={lvl},axum={lvl}",
            lvl = level_name
        ))
    });

    if json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );

        subscriber.try_init().map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .pretty()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );

        subscriber.try_init().map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from IndexerConfig
pub fn init_from_config(config: &super::config::IndexerConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    let json_format = config.log_json || config.network == super::config::Network::Mainnet;

    init_logging(level, json_format)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Ingest, "Test event")
            .with_correlation_id("test-123")
            .with_data(serde_json::json!({"key": "value"}))
            .with_duration(42);

        let json = event.to_json();
        assert!(json.contains("Test event"));
        assert!(json.contains("test-123"));
        assert!(json.contains("\"category\":\"ingest\""));
        assert!(json.contains("42"));
    }

    #[test]
    fn test_error_details_serialization() {
        let event = LogEvent::new(LogLevel::Warn, EventCategory::Fault, "fault")
            .with_error("LEDGER_CONSISTENCY_FAULT", "balance would go negative");

        let json = event.to_json();
        assert!(json.contains("LEDGER_CONSISTENCY_FAULT"));
        assert!(json.contains("\"level\":\"WARN\""));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_correlation_id_generation() {
        let id1 = generate_correlation_id();
        let id2 = generate_correlation_id();

        assert_eq!(id1.len(), 36);
        assert_ne!(id1, id2);
    }
}

//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the indexer.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{
    BitcoinSettings, ConfigError, EvmChainSettings, IndexerConfig, Network, SolanaSettings,
    VaultAsset,
};
pub use error::{IndexerError, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_api_request, log_api_response,
    log_credit_event, log_fault, log_ingest_event, log_reconciliation_report, ErrorDetails,
    EventCategory, LogEvent, LogLevel, LoggingError,
};

//! API Middleware - Request Logging, Rate Limiting and Input Validation
//!
//! - Correlation-id request logging for every route
//! - Per-client rate limiting for address registration
//! - Address validation for registration requests
//! - `ApiError`, the JSON error body shared by all handlers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::common::{generate_correlation_id, log_api_request, log_api_response, IndexerError};
use crate::storage::StorageError;

/// Response header carrying the request's correlation id
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Longest accepted user address (EVM hex, Solana base58 and Bitcoin all fit)
pub const MAX_USER_ADDRESS_LEN: usize = 128;

/// Tracked clients before expired windows are pruned
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Retry hint sent with errors a client may simply repeat
const RETRYABLE_AFTER_SECS: u64 = 5;

// ============================================================================
// Errors
// ============================================================================

/// JSON error body returned by every handler
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            code,
            retry_after: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", error)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", error)
    }

    pub fn forbidden(error: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", error)
    }

    pub fn conflict(error: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", error)
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "Rate limit exceeded")
        }
    }
}

impl From<IndexerError> for ApiError {
    fn from(err: IndexerError) -> Self {
        let status = match &err {
            IndexerError::Validation(_) => StatusCode::BAD_REQUEST,
            IndexerError::TransientProvider(_) => StatusCode::SERVICE_UNAVAILABLE,
            IndexerError::MalformedEvent(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut api_err = Self::new(status, err.error_code(), err.to_string());
        if err.is_retryable() {
            api_err.retry_after = Some(RETRYABLE_AFTER_SECS);
        }
        api_err
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        IndexerError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from(secs));
        }
        response
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Time window duration
    pub window: Duration,
    /// Extra requests allowed temporarily
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::registration()
    }
}

impl RateLimitConfig {
    /// Limits for address registration
    pub fn registration() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            burst: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
    burst_tokens: u32,
}

/// Fixed-window limiter keyed by client id
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: RwLock<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `Err(retry_after_secs)` when `client_id` is over its limit
    pub async fn check(&self, client_id: &str) -> Result<(), u64> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if entries.len() >= MAX_TRACKED_CLIENTS {
            let expiry = self.config.window * 2;
            entries.retain(|_, entry| now.duration_since(entry.window_start) < expiry);
        }

        let entry = entries.entry(client_id.to_string()).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
            burst_tokens: self.config.burst,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
            // burst refills slowly
            entry.burst_tokens = self.config.burst.min(entry.burst_tokens + 1);
        }

        if entry.count < self.config.max_requests {
            entry.count += 1;
            Ok(())
        } else if entry.burst_tokens > 0 {
            entry.burst_tokens -= 1;
            entry.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(entry.window_start).as_secs();
            Err(self.config.window.as_secs().saturating_sub(elapsed).max(1))
        }
    }
}

/// Shared rate limiter state
pub type RateLimitState = Arc<RateLimiter>;

/// Client id: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Rejects requests from clients over their limit
pub async fn rate_limit(State(limiter): State<RateLimitState>, request: Request, next: Next) -> Response {
    let client = client_id(request.headers(), peer_addr(&request));

    match limiter.check(&client).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!("Rate limit exceeded for {}", client);
            ApiError::rate_limited(retry_after).into_response()
        }
    }
}

// ============================================================================
// Request Logging
// ============================================================================

/// Logs each request and response under one correlation id
pub async fn request_logging(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let correlation_id = generate_correlation_id();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client = client_id(request.headers(), peer_addr(&request));

    log_api_request(&method, &path, Some(&client), &correlation_id);

    let mut response = next.run(request).await;

    log_api_response(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
        &correlation_id,
    );
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    response
}

// ============================================================================
// Input Validation
// ============================================================================

/// Parse a Bitcoin address for `network` and return its canonical form
pub fn normalize_bitcoin_address(address: &str, network: bitcoin::Network) -> Result<String, ApiError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("deposit_address is required"));
    }

    let unchecked = Address::<NetworkUnchecked>::from_str(trimmed)
        .map_err(|e| ApiError::bad_request(format!("invalid Bitcoin address: {}", e)))?;
    let checked = unchecked
        .require_network(network)
        .map_err(|_| ApiError::bad_request(format!("address is not valid for {}", network)))?;

    Ok(checked.to_string())
}

/// Loose check on the owner address; its format depends on the product
pub fn validate_user_address(user: &str) -> Result<(), ApiError> {
    if user.is_empty() {
        return Err(ApiError::bad_request("user_address is required"));
    }
    if user.len() > MAX_USER_ADDRESS_LEN {
        return Err(ApiError::bad_request("user_address is too long"));
    }
    if user.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ApiError::bad_request("user_address contains whitespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitcoin_address_validation() {
        let testnet = bitcoin::Network::Testnet;

        assert_eq!(
            normalize_bitcoin_address(" tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx ", testnet).unwrap(),
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx"
        );
        // mainnet address on a testnet deployment
        assert!(normalize_bitcoin_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", testnet).is_err());
        assert!(normalize_bitcoin_address(
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
            bitcoin::Network::Bitcoin
        )
        .is_ok());

        assert!(normalize_bitcoin_address("", testnet).is_err());
        assert!(normalize_bitcoin_address("not-an-address", testnet).is_err());
    }

    #[test]
    fn test_user_address_validation() {
        assert!(validate_user_address("0x9fB29AAc15b9A4B7F17c3385939b007540f4d791").is_ok());
        assert!(validate_user_address("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM").is_ok());
        assert!(validate_user_address("").is_err());
        assert!(validate_user_address("has space").is_err());
        assert!(validate_user_address(&"a".repeat(MAX_USER_ADDRESS_LEN + 1)).is_err());
    }

    #[test]
    fn test_client_id_precedence() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        assert_eq!(client_id(&headers, Some(peer)), "10.0.0.7");

        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.4"));
        assert_eq!(client_id(&headers, Some(peer)), "192.0.2.4");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(client_id(&headers, None), "203.0.113.9");
    }

    #[test]
    fn test_indexer_error_status() {
        let err: ApiError = IndexerError::validation("bad").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "VALIDATION_ERROR");

        assert_eq!(err.retry_after, None);

        let err: ApiError = IndexerError::transient("rpc down").into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.retry_after, Some(RETRYABLE_AFTER_SECS));
    }

    #[tokio::test]
    async fn test_rate_limiter() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
            burst: 1,
        });

        for _ in 0..3 {
            assert!(limiter.check("client1").await.is_ok());
        }
        // burst
        assert!(limiter.check("client1").await.is_ok());

        let retry_after = limiter.check("client1").await.unwrap_err();
        assert!(retry_after >= 1 && retry_after <= 60);

        assert!(limiter.check("client2").await.is_ok());
    }
}

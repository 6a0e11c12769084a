//! Query API Handlers
//!
//! - GET /api/health - Liveness
//! - GET /api/status - Per-pair cursors, failures, faults and last reconciliation
//! - GET /api/balances/:chain/:asset/:user - Share balance of one user
//! - GET /api/deposits/:deposit_address - Deposits into a Bitcoin deposit address
//! - POST /api/addresses - Bind a Bitcoin deposit address to a user
//! - DELETE /api/addresses/:deposit_address - Stop watching an address (owner only)
//! - POST /api/reconcile - Run reconciliation now (`?chain=&asset=` for one pair)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::middleware::{normalize_bitcoin_address, validate_user_address, ApiError};
use super::SharedApiState;
use crate::storage::StorageError;
use crate::types::units::amount_string;
use crate::types::{AddressBinding, DepositRecord, LedgerKey};

/// Body of POST /api/addresses
#[derive(Debug, Deserialize)]
pub struct RegisterAddressRequest {
    pub user_address: String,
    pub deposit_address: String,
}

/// Body of DELETE /api/addresses/:deposit_address
#[derive(Debug, Deserialize)]
pub struct DeactivateAddressRequest {
    pub user_address: String,
}

/// GET /api/balances response
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub chain: String,
    pub asset: String,
    pub user_address: String,
    #[serde(with = "amount_string")]
    pub shares: u128,
}

/// GET /api/deposits response
#[derive(Debug, Serialize)]
pub struct DepositsResponse {
    pub deposit_address: String,
    pub binding: Option<AddressBinding>,
    pub count: usize,
    pub deposits: Vec<DepositRecord>,
}

/// Optional pair selector for POST /api/reconcile
#[derive(Debug, Default, Deserialize)]
pub struct ReconcileQuery {
    pub chain: Option<String>,
    pub asset: Option<String>,
}

/// GET /api/health
pub async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nexxore-indexer",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /api/status
pub async fn handle_status(State(state): State<SharedApiState>) -> impl IntoResponse {
    Json(state.health.snapshot().await)
}

/// GET /api/balances/:chain/:asset/:user
pub async fn handle_get_balance(
    State(state): State<SharedApiState>,
    Path((chain, asset, user)): Path<(String, String, String)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let key = LedgerKey::new(chain.to_lowercase(), asset);
    let shares = state.ledger.get_balance(&key, &user).await?;

    Ok(Json(BalanceResponse {
        chain: key.chain,
        asset: key.asset,
        user_address: user,
        shares,
    }))
}

/// GET /api/deposits/:deposit_address
///
/// Unknown addresses return an empty list.
pub async fn handle_get_deposits(
    State(state): State<SharedApiState>,
    Path(deposit_address): Path<String>,
) -> Result<Json<DepositsResponse>, ApiError> {
    let address = normalize_bitcoin_address(&deposit_address, state.bitcoin_network).unwrap_or(deposit_address);

    let binding = state.bindings.binding_for(&address).await?;
    let deposits = state.ledger.deposits_by_address(&address).await?;

    Ok(Json(DepositsResponse {
        deposit_address: address,
        binding,
        count: deposits.len(),
        deposits,
    }))
}

/// POST /api/addresses
pub async fn handle_register_address(
    State(state): State<SharedApiState>,
    Json(req): Json<RegisterAddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = req.user_address.trim();
    validate_user_address(user)?;
    let deposit_address = normalize_bitcoin_address(&req.deposit_address, state.bitcoin_network)?;

    let binding = AddressBinding::new(user, deposit_address);
    match state.bindings.register_address(&binding).await {
        Ok(stored) => {
            tracing::info!(
                "Registered deposit address {} for {}",
                stored.deposit_address,
                stored.user_address
            );
            Ok((StatusCode::CREATED, Json(stored)))
        }
        Err(StorageError::Duplicate(address)) => Err(ApiError::conflict(format!(
            "{} is bound to another user",
            address
        ))),
        Err(e) => Err(e.into()),
    }
}

/// DELETE /api/addresses/:deposit_address
///
/// Only the user the address is bound to may deactivate it.
pub async fn handle_deactivate_address(
    State(state): State<SharedApiState>,
    Path(deposit_address): Path<String>,
    Json(req): Json<DeactivateAddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = req.user_address.trim();
    validate_user_address(user)?;
    let address = normalize_bitcoin_address(&deposit_address, state.bitcoin_network).unwrap_or(deposit_address);

    let binding = state
        .bindings
        .binding_for(&address)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{} is not registered", address)))?;
    if binding.user_address != user {
        return Err(ApiError::forbidden(format!("{} is not bound to {}", address, user)));
    }

    if !state.bindings.deactivate_address(&address).await? {
        return Err(ApiError::not_found(format!("{} is not registered", address)));
    }

    tracing::info!("Deactivated deposit address {} for {}", address, user);
    Ok(Json(serde_json::json!({
        "deposit_address": address,
        "active": false
    })))
}

/// POST /api/reconcile
///
/// Reports are returned whatever their outcome; a mismatch is not an error.
pub async fn handle_reconcile(
    State(state): State<SharedApiState>,
    Query(query): Query<ReconcileQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let reports = match (query.chain, query.asset) {
        (Some(chain), Some(asset)) => {
            let key = LedgerKey::new(chain.to_lowercase(), asset);
            if !state.reconciler.keys().contains(&key) {
                return Err(ApiError::not_found(format!("{} is not watched", key)));
            }
            vec![state.reconciler.reconcile(&key).await?]
        }
        (None, None) => state.reconciler.reconcile_all().await,
        _ => return Err(ApiError::bad_request("chain and asset must be given together")),
    };

    let mismatches = reports.iter().filter(|r| !r.is_match()).count();
    Ok(Json(serde_json::json!({
        "count": reports.len(),
        "mismatches": mismatches,
        "reports": reports
    })))
}

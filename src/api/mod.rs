//! API Layer Module
//!
//! Axum router for the query and registration surface. Reads go straight to
//! the ledger; the only client-initiated writes are address bindings.

pub mod middleware;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::health::HealthRegistry;
use crate::reconciler::Reconciler;
use crate::storage::{BindingStore, LedgerStore};

pub use middleware::{ApiError, RateLimitConfig, RateLimitState, RateLimiter};

/// State shared by every handler
pub struct ApiState {
    pub ledger: Arc<dyn LedgerStore>,
    pub bindings: Arc<dyn BindingStore>,
    pub reconciler: Arc<Reconciler>,
    pub health: Arc<HealthRegistry>,
    /// Network registered deposit addresses must belong to
    pub bitcoin_network: bitcoin::Network,
    pub limiter: RateLimitState,
}

/// Shared app state type
pub type SharedApiState = Arc<ApiState>;

impl ApiState {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        bindings: Arc<dyn BindingStore>,
        reconciler: Arc<Reconciler>,
        health: Arc<HealthRegistry>,
        bitcoin_network: bitcoin::Network,
    ) -> Self {
        Self {
            ledger,
            bindings,
            reconciler,
            health,
            bitcoin_network,
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::registration())),
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.limiter = Arc::new(RateLimiter::new(config));
        self
    }
}

/// Create the API router
pub fn create_router(state: SharedApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let registration = Router::new()
        .route("/api/addresses", post(routes::handle_register_address))
        .route("/api/addresses/:deposit_address", delete(routes::handle_deactivate_address))
        .route_layer(from_fn_with_state(state.limiter.clone(), middleware::rate_limit));

    Router::new()
        .route("/api/health", get(routes::handle_health))
        .route("/api/status", get(routes::handle_status))
        .route("/api/balances/:chain/:asset/:user", get(routes::handle_get_balance))
        .route("/api/deposits/:deposit_address", get(routes::handle_get_deposits))
        .route("/api/reconcile", post(routes::handle_reconcile))
        .merge(registration)
        .layer(from_fn(middleware::request_logging))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `cancel` fires
pub async fn start_server(state: SharedApiState, port: u16, cancel: CancellationToken) -> std::io::Result<()> {
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("API listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CursorStore, MemoryStore};
    use crate::types::{DepositStatus, EventKind, LedgerKey, NormalizedEvent, TxIdentifier};
    use crate::watcher::MockChainWatcher;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    const ADDRESS: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn usdc() -> LedgerKey {
        LedgerKey::new("ethereum", "USDC")
    }

    fn state_with(store: &MemoryStore, chain_total: u128) -> ApiState {
        let health = Arc::new(HealthRegistry::new());
        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(usdc);
        watcher.expect_genesis().return_const(0u64);
        watcher
            .expect_authoritative_total_shares()
            .returning(move |_| Ok(chain_total));

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            vec![Arc::new(watcher)],
            health.clone(),
            0,
        ));
        ApiState::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            reconciler,
            health,
            bitcoin::Network::Testnet,
        )
    }

    fn app(store: &MemoryStore) -> Router {
        create_router(Arc::new(state_with(store, 0)))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = app(&MemoryStore::default())
            .oneshot(get_req("/api/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(middleware::CORRELATION_HEADER));
    }

    #[tokio::test]
    async fn test_register_then_list_deposits() {
        let store = MemoryStore::default();
        let app = app(&store);

        let response = app
            .clone()
            .oneshot(json_req(
                "POST",
                "/api/addresses",
                serde_json::json!({ "user_address": "0xuser", "deposit_address": ADDRESS }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(get_req(&format!("/api/deposits/{}", ADDRESS)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["binding"]["user_address"], "0xuser");
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_and_taken_addresses() {
        let store = MemoryStore::default();
        let app = app(&store);

        let response = app
            .clone()
            .oneshot(json_req(
                "POST",
                "/api/addresses",
                serde_json::json!({
                    "user_address": "0xuser",
                    "deposit_address": "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");

        for (user, expected) in [("0xalice", StatusCode::CREATED), ("0xbob", StatusCode::CONFLICT)] {
            let response = app
                .clone()
                .oneshot(json_req(
                    "POST",
                    "/api/addresses",
                    serde_json::json!({ "user_address": user, "deposit_address": ADDRESS }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_registration_is_rate_limited() {
        let store = MemoryStore::default();
        let state = state_with(&store, 0).with_rate_limit(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        });
        let app = create_router(Arc::new(state));
        let body = serde_json::json!({ "user_address": "0xuser", "deposit_address": ADDRESS });

        let first = app.clone().oneshot(json_req("POST", "/api/addresses", body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app.clone().oneshot(json_req("POST", "/api/addresses", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));

        // reads are not limited
        let read = app.oneshot(get_req("/api/status")).await.unwrap();
        assert_eq!(read.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deactivate_address_requires_owner() {
        let store = MemoryStore::default();
        let app = app(&store);
        let uri = format!("/api/addresses/{}", ADDRESS);

        let missing = app
            .clone()
            .oneshot(json_req("DELETE", &uri, serde_json::json!({ "user_address": "0xuser" })))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        store
            .register_address(&crate::types::AddressBinding::new("0xuser", ADDRESS))
            .await
            .unwrap();

        let stranger = app
            .clone()
            .oneshot(json_req("DELETE", &uri, serde_json::json!({ "user_address": "0xmallory" })))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);
        assert_eq!(store.active_bindings().await.unwrap().len(), 1);

        let owner = app
            .oneshot(json_req("DELETE", &uri, serde_json::json!({ "user_address": "0xuser" })))
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::OK);
        assert!(store.active_bindings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivation_shares_the_registration_limit() {
        let store = MemoryStore::default();
        let state = state_with(&store, 0).with_rate_limit(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        });
        let app = create_router(Arc::new(state));
        let uri = format!("/api/addresses/{}", ADDRESS);
        let body = serde_json::json!({ "user_address": "0xuser" });

        let first = app.clone().oneshot(json_req("DELETE", &uri, body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);

        let second = app.oneshot(json_req("DELETE", &uri, body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_balance_reads_ledger() {
        let store = MemoryStore::default();
        let event = NormalizedEvent {
            kind: EventKind::Deposit,
            key: usdc(),
            user_address: "0xuser".to_string(),
            deposit_address: None,
            tx: TxIdentifier::evm("0xabc", 2),
            assets_amount: 500,
            shares_amount: 480,
            timestamp: 1_700_000_000,
            confirmations: 12,
            status: DepositStatus::Confirmed,
            block_position: 120,
        };
        store.apply_batch(&usdc(), &[event], 101, 200).await.unwrap();

        let response = app(&store)
            .oneshot(get_req("/api/balances/Ethereum/USDC/0xuser"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["chain"], "ethereum");
        assert_eq!(body["shares"], "480");

        let response = app(&store)
            .oneshot(get_req("/api/balances/ethereum/USDC/0xnobody"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["shares"], "0");
    }

    #[tokio::test]
    async fn test_reconcile_endpoint() {
        let store = MemoryStore::default();
        store.apply_batch(&usdc(), &[], 1, 50).await.unwrap();
        store.set_cursor(&usdc(), 50).await.unwrap();
        let app = create_router(Arc::new(state_with(&store, 25)));

        let response = app.clone().oneshot(json_req("POST", "/api/reconcile", serde_json::json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["mismatches"], 1);
        assert_eq!(body["reports"][0]["drift"], "25");
        assert_eq!(body["reports"][0]["position"], 50);

        let response = app
            .clone()
            .oneshot(json_req("POST", "/api/reconcile?chain=solana&asset=USDC", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_req("POST", "/api/reconcile?chain=ethereum", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

//! Environment-based Configuration for the Indexer
//!
//! Every setting comes from a `NEXXORE_`-prefixed environment variable
//! (a `.env` file is honoured by the binary). Parsing runs over a lookup
//! function so that tests can supply values without touching process state.
//!
//! # Core
//! - `NEXXORE_NETWORK` - "mainnet", "testnet" or "devnet" (default: "devnet")
//! - `NEXXORE_DB_PATH` - SQLite file, or `:memory:` (default: "data/nexxore-ledger.db")
//! - `NEXXORE_API_PORT` - HTTP port (default: 3001)
//! - `NEXXORE_LOG_LEVEL` / `NEXXORE_LOG_JSON`
//!
//! # EVM
//! - `NEXXORE_EVM_CHAINS` - comma separated chain names, e.g. "ethereum,base"
//! - `NEXXORE_EVM_<NAME>_RPC` - JSON-RPC endpoint
//! - `NEXXORE_EVM_<NAME>_VAULTS` - `ASSET=0xvault@cursorStart,...`
//! - `NEXXORE_EVM_<NAME>_CHUNK` / `NEXXORE_EVM_<NAME>_FINALITY_DEPTH`
//!
//! # Solana
//! - `NEXXORE_SOLANA_RPC`, `NEXXORE_SOLANA_PROGRAM_ID`
//! - `NEXXORE_SOLANA_ASSETS` - `ASSET=<mint>@cursorStart,...`
//! - `NEXXORE_SOLANA_CHUNK`
//!
//! # Bitcoin
//! - `NEXXORE_BITCOIN_API`, `NEXXORE_BITCOIN_ENABLED`, `NEXXORE_BITCOIN_GENESIS`,
//!   `NEXXORE_BITCOIN_CONFIRMATIONS`
//!
//! The `@cursorStart` suffix is the position a fresh cursor starts at; the
//! first scanned position is the one after it.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "NEXXORE_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get default Solana RPC for this network
    pub fn default_solana_rpc(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
        }
    }

    /// Get default Bitcoin/Esplora API for this network
    pub fn default_bitcoin_api(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://blockstream.info/api",
            Network::Testnet | Network::Devnet => "https://blockstream.info/testnet/api",
        }
    }

    /// Get bitcoin network enum, used to validate registered addresses
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet | Network::Devnet => bitcoin::Network::Testnet,
        }
    }
}

/// One watched vault: the asset symbol, the on-chain address (vault
/// contract for EVM, token mint for Solana) and where its cursor starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultAsset {
    pub asset: String,
    pub address: String,
    pub genesis: u64,
}

/// Settings for one EVM-compatible chain
#[derive(Debug, Clone)]
pub struct EvmChainSettings {
    /// Chain name used as the ledger `chain` value (lowercase)
    pub name: String,
    pub rpc_url: String,
    pub vaults: Vec<VaultAsset>,
    /// Blocks per `eth_getLogs` query
    pub chunk_size: u64,
    /// Blocks behind head treated as final
    pub finality_depth: u64,
}

/// Solana program settings
#[derive(Debug, Clone)]
pub struct SolanaSettings {
    pub rpc_url: String,
    pub program_id: String,
    pub assets: Vec<VaultAsset>,
    /// Slots per historical range
    pub chunk_size: u64,
}

/// Bitcoin deposit-address settings
#[derive(Debug, Clone)]
pub struct BitcoinSettings {
    pub api_url: String,
    pub enabled: bool,
    pub genesis: u64,
    pub confirmations_required: u32,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Network environment
    pub network: Network,

    /// SQLite database path (`:memory:` for an in-memory database)
    pub db_path: String,

    /// HTTP API port
    pub api_port: u16,

    /// Log level
    pub log_level: String,

    /// Force JSON log output
    pub log_json: bool,

    pub evm_chains: Vec<EvmChainSettings>,
    pub solana: Option<SolanaSettings>,
    pub bitcoin: BitcoinSettings,

    /// Seconds between live polls
    pub live_poll_secs: u64,

    /// Positions re-fetched behind the cursor by the live subscription
    pub live_overlap: u64,

    /// Seconds between confirmation polls
    pub confirmation_poll_secs: u64,

    /// Seconds between scheduled reconciliations
    pub reconcile_interval_secs: u64,

    /// Absolute share drift tolerated before a mismatch becomes a fault
    pub reconcile_tolerance: u128,

    /// Upper bound on time spent retrying a single provider call
    pub retry_max_elapsed_secs: u64,

    /// Per-request timeout for RPC and HTTP clients
    pub rpc_timeout_secs: u64,

    /// Optional endpoint receiving credit notifications
    pub credit_webhook_url: Option<String>,
}

impl IndexerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("NEXXORE_{}", name)).filter(|v| !v.trim().is_empty());

        let network: Network = var("NETWORK")
            .unwrap_or_else(|| "devnet".to_string())
            .parse()?;

        let db_path = var("DB_PATH").unwrap_or_else(|| "data/nexxore-ledger.db".to_string());
        let api_port = parse_or("API_PORT", var("API_PORT"), 3001u16)?;
        let log_level = var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_json = var("LOG_JSON").map(|v| is_truthy(&v)).unwrap_or(false);

        // EVM chains
        let mut evm_chains = Vec::new();
        if let Some(names) = var("EVM_CHAINS") {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let upper = name.to_uppercase();
                let rpc_name = format!("EVM_{}_RPC", upper);
                let rpc_url = var(&rpc_name)
                    .ok_or_else(|| ConfigError::MissingEnvVar(format!("NEXXORE_{}", rpc_name)))?;
                let vaults_name = format!("EVM_{}_VAULTS", upper);
                let vaults = parse_vault_list(&vaults_name, &var(&vaults_name).unwrap_or_default())?;
                let chunk_name = format!("EVM_{}_CHUNK", upper);
                let chunk_size = parse_or(&chunk_name, var(&chunk_name), 10_000u64)?;
                let depth_name = format!("EVM_{}_FINALITY_DEPTH", upper);
                let finality_depth = parse_or(&depth_name, var(&depth_name), 12u64)?;

                if chunk_size == 0 {
                    return Err(ConfigError::InvalidValue(
                        format!("NEXXORE_{}", chunk_name),
                        "chunk size must be positive".to_string(),
                    ));
                }

                evm_chains.push(EvmChainSettings {
                    name: name.to_lowercase(),
                    rpc_url,
                    vaults,
                    chunk_size,
                    finality_depth,
                });
            }
        }

        // Solana is enabled when at least one asset is listed
        let solana_assets = parse_vault_list("SOLANA_ASSETS", &var("SOLANA_ASSETS").unwrap_or_default())?;
        let solana = if solana_assets.is_empty() {
            None
        } else {
            let program_id = var("SOLANA_PROGRAM_ID")
                .ok_or_else(|| ConfigError::MissingEnvVar("NEXXORE_SOLANA_PROGRAM_ID".to_string()))?;
            let chunk_size = parse_or("SOLANA_CHUNK", var("SOLANA_CHUNK"), 100_000u64)?;
            Some(SolanaSettings {
                rpc_url: var("SOLANA_RPC").unwrap_or_else(|| network.default_solana_rpc().to_string()),
                program_id,
                assets: solana_assets,
                chunk_size: chunk_size.max(1),
            })
        };

        let bitcoin = BitcoinSettings {
            api_url: var("BITCOIN_API").unwrap_or_else(|| network.default_bitcoin_api().to_string()),
            enabled: var("BITCOIN_ENABLED").map(|v| is_truthy(&v)).unwrap_or(true),
            genesis: parse_or("BITCOIN_GENESIS", var("BITCOIN_GENESIS"), 0u64)?,
            confirmations_required: parse_or("BITCOIN_CONFIRMATIONS", var("BITCOIN_CONFIRMATIONS"), 3u32)?,
        };

        Ok(Self {
            network,
            db_path,
            api_port,
            log_level,
            log_json,
            evm_chains,
            solana,
            bitcoin,
            live_poll_secs: parse_or("LIVE_POLL_SECS", var("LIVE_POLL_SECS"), 15u64)?.max(1),
            live_overlap: parse_or("LIVE_OVERLAP", var("LIVE_OVERLAP"), 5u64)?,
            confirmation_poll_secs: parse_or("CONFIRMATION_POLL_SECS", var("CONFIRMATION_POLL_SECS"), 30u64)?
                .max(1),
            reconcile_interval_secs: parse_or(
                "RECONCILE_INTERVAL_SECS",
                var("RECONCILE_INTERVAL_SECS"),
                300u64,
            )?
            .max(1),
            reconcile_tolerance: parse_or("RECONCILE_TOLERANCE", var("RECONCILE_TOLERANCE"), 0u128)?,
            retry_max_elapsed_secs: parse_or("RETRY_MAX_ELAPSED_SECS", var("RETRY_MAX_ELAPSED_SECS"), 60u64)?,
            rpc_timeout_secs: parse_or("RPC_TIMEOUT_SECS", var("RPC_TIMEOUT_SECS"), 30u64)?.max(1),
            credit_webhook_url: var("CREDIT_WEBHOOK_URL"),
        })
    }

    /// Request timeout applied to every outbound client
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Upper bound on retrying a single provider call
    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.retry_max_elapsed_secs)
    }

    /// Log configuration summary (endpoints only, no credentials in query strings)
    pub fn print_summary(&self) {
        tracing::info!("=== Indexer Configuration ===");
        tracing::info!("Network: {:?}", self.network);
        tracing::info!("Database: {}", self.db_path);
        tracing::info!("API port: {}", self.api_port);
        for chain in &self.evm_chains {
            tracing::info!(
                "EVM {}: {} vault(s), rpc {}, chunk {}, finality depth {}",
                chain.name,
                chain.vaults.len(),
                redact_url(&chain.rpc_url),
                chain.chunk_size,
                chain.finality_depth
            );
        }
        match &self.solana {
            Some(sol) => tracing::info!(
                "Solana: program {}, {} asset(s), rpc {}",
                sol.program_id,
                sol.assets.len(),
                redact_url(&sol.rpc_url)
            ),
            None => tracing::info!("Solana: disabled"),
        }
        tracing::info!(
            "Bitcoin: {} ({}), {} confirmations",
            if self.bitcoin.enabled { "enabled" } else { "disabled" },
            redact_url(&self.bitcoin.api_url),
            self.bitcoin.confirmations_required
        );
        tracing::info!(
            "Polling: live {}s (overlap {}), confirmations {}s, reconcile {}s",
            self.live_poll_secs,
            self.live_overlap,
            self.confirmation_poll_secs,
            self.reconcile_interval_secs
        );
        tracing::info!("Credit webhook: {}", self.credit_webhook_url.is_some());
        tracing::info!("=============================");
    }
}

/// Parse `ASSET=address@start` entries separated by commas
fn parse_vault_list(var_name: &str, raw: &str) -> Result<Vec<VaultAsset>, ConfigError> {
    let mut out = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = |why: &str| {
            ConfigError::InvalidValue(format!("NEXXORE_{}", var_name), format!("{}: {}", why, entry))
        };

        let (asset, rest) = entry.split_once('=').ok_or_else(|| invalid("expected ASSET=address"))?;
        let (address, genesis) = match rest.split_once('@') {
            Some((address, start)) => (
                address,
                start.trim().parse::<u64>().map_err(|_| invalid("start must be a number"))?,
            ),
            None => (rest, 0),
        };

        if asset.trim().is_empty() || address.trim().is_empty() {
            return Err(invalid("empty asset or address"));
        }

        out.push(VaultAsset {
            asset: asset.trim().to_string(),
            address: address.trim().to_string(),
            genesis,
        });
    }

    Ok(out)
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("NEXXORE_{}", name), format!("not a number: {}", v))
        }),
        None => Ok(default),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Strip path and query from an endpoint; hosted RPC keys usually live there
fn redact_url(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            let host = rest.split(['/', '?']).next().unwrap_or(rest);
            format!("{}{}", &url[..scheme_end + 3], host)
        }
        None => url.to_string(),
    }
}

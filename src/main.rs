//! Nexxore Indexer
//!
//! Run modes:
//!   nexxore-indexer serve [--port <port>]                  - Run all watchers, periodic tasks and the API
//!   nexxore-indexer reconcile [--chain <c> --asset <a>]    - One reconciliation pass, reports as JSON
//!   nexxore-indexer status                                 - Stored cursors and ledger totals as JSON
//!   nexxore-indexer help                                   - Show usage
//!
//! Configuration is read from `NEXXORE_*` environment variables; a `.env`
//! file in the working directory is loaded first.

use std::env;
use std::process::ExitCode;

use nexxore_indexer::common::{init_from_config, IndexerConfig};
use nexxore_indexer::{IndexerService, LedgerKey};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let command = match args.get(1) {
        Some(command) => command.as_str(),
        None => {
            print_usage();
            return ExitCode::SUCCESS;
        }
    };

    if matches!(command, "help" | "--help" | "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let mut config = match IndexerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        "serve" => {
            if let Some(port) = flag(&args[2..], "--port") {
                match port.parse() {
                    Ok(port) => config.api_port = port,
                    Err(_) => {
                        eprintln!("Invalid --port: {}", port);
                        return ExitCode::FAILURE;
                    }
                }
            }
            run_serve(config).await
        }
        "reconcile" => run_reconcile(config, &args[2..]).await,
        "status" => run_status(config).await,
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error [{}]: {}", e.error_code(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("Nexxore Indexer - multi-chain vault ledger");
    println!();
    println!("Usage:");
    println!("  nexxore-indexer serve [--port <port>]                 Run watchers, tasks and the API (default port: 3001)");
    println!("  nexxore-indexer reconcile [--chain <c> --asset <a>]   Reconcile now and print the reports");
    println!("  nexxore-indexer status                                Print stored cursors and ledger totals");
    println!("  nexxore-indexer help                                  Show this message");
    println!();
    println!("Environment Variables:");
    println!("  NEXXORE_NETWORK           mainnet | testnet | devnet (default: devnet)");
    println!("  NEXXORE_DB_PATH           SQLite path or :memory: (default: data/nexxore-ledger.db)");
    println!("  NEXXORE_EVM_CHAINS        Comma separated EVM chain names");
    println!("  NEXXORE_EVM_<NAME>_RPC    JSON-RPC endpoint for a chain");
    println!("  NEXXORE_EVM_<NAME>_VAULTS ASSET=0xvault@startBlock,...");
    println!("  NEXXORE_SOLANA_ASSETS     ASSET=<mint>@startSlot,...");
    println!("  NEXXORE_SOLANA_PROGRAM_ID Vault program id");
    println!("  NEXXORE_BITCOIN_API       Esplora base URL");
    println!("  NEXXORE_CREDIT_WEBHOOK_URL Endpoint receiving credit notices");
}

/// Value following `name` in `args`
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn init(config: &IndexerConfig) -> nexxore_indexer::Result<IndexerService> {
    init_from_config(config)?;
    IndexerService::from_config(config.clone())
}

async fn run_serve(config: IndexerConfig) -> nexxore_indexer::Result<()> {
    let service = init(&config)?;
    config.print_summary();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C");
        }
        on_signal.cancel();
    });

    service.run(cancel).await
}

async fn run_reconcile(config: IndexerConfig, args: &[String]) -> nexxore_indexer::Result<()> {
    let service = init(&config)?;
    let reconciler = service.reconciler();

    let reports = match (flag(args, "--chain"), flag(args, "--asset")) {
        (Some(chain), Some(asset)) => vec![reconciler.reconcile(&LedgerKey::new(chain.to_lowercase(), asset)).await?],
        (None, None) => reconciler.reconcile_all().await,
        _ => {
            return Err(nexxore_indexer::IndexerError::validation(
                "--chain and --asset must be given together",
            ))
        }
    };

    let json = serde_json::to_string_pretty(&reports)
        .map_err(|e| nexxore_indexer::IndexerError::internal(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

async fn run_status(config: IndexerConfig) -> nexxore_indexer::Result<()> {
    let service = init(&config)?;
    let status = service.pair_status().await?;

    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| nexxore_indexer::IndexerError::internal(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

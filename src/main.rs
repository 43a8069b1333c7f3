//! Bundle Engine demo
//!
//! Funds a handful of in-memory wallets, pushes random transfers through the
//! engine and prints the final stats snapshot.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌─────────────┐
//! │ Keyring  │───▶│  Engine  │───▶│ Workers  │───▶│ LocalLedger │
//! │(wallets) │    │ (bundle) │    │ (submit) │    │  (balances) │
//! └──────────┘    └──────────┘    └──────────┘    └─────────────┘
//! ```
//!
//! Usage: `bundle_engine --env dev --transfers 200 --wallets 8`

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use rand::Rng;
use tracing::{info, warn};

use bundle_engine::bundle::{Ed25519Verifier, Keyring, LocalLedger};
use bundle_engine::config::AppConfig;
use bundle_engine::core_types::Identity;
use bundle_engine::{BundleEngine, EngineDeps};

const INITIAL_BALANCE: u64 = 1_000_000_000;

fn arg_value(name: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1).cloned())
}

fn get_env() -> String {
    arg_value("--env").unwrap_or_else(|| "dev".to_string())
}

fn get_count(name: &str, default: usize) -> anyhow::Result<usize> {
    match arg_value(name) {
        Some(v) => v
            .parse()
            .with_context(|| format!("{name} expects a number, got {v}")),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let transfers = get_count("--transfers", 100)?;
    let wallet_count = get_count("--wallets", 8)?.max(2);

    let app_config = AppConfig::load(&env)?;
    let _log_guard = bundle_engine::logging::init_logging(&app_config);

    info!(env = %env, transfers, wallets = wallet_count, "Starting bundle engine demo");

    let keyring = Arc::new(Keyring::new());
    let ledger = Arc::new(LocalLedger::new());
    let wallets: Vec<Identity> = (0..wallet_count)
        .map(|i| {
            let id = keyring.generate(Some(&format!("wallet-{i}"))).identity();
            ledger.credit(id, INITIAL_BALANCE);
            id
        })
        .collect();

    let deps = EngineDeps::new(keyring.clone(), ledger.clone())
        .with_verifier(Arc::new(Ed25519Verifier::new()));
    let engine = BundleEngine::new(app_config.engine.clone(), deps)?;

    // Draw everything up front; the thread-local rng must not live across awaits.
    let plan: Vec<(Identity, Identity, u64, String)> = {
        let mut rng = rand::thread_rng();
        (0..transfers)
            .map(|i| {
                let from = rng.gen_range(0..wallets.len());
                let to = (from + rng.gen_range(1..wallets.len())) % wallets.len();
                let amount = rng.gen_range(1..=10_000u64);
                (wallets[from], wallets[to], amount, format!("client-{}", i % 16))
            })
            .collect()
    };

    let start = Instant::now();
    let mut rejected = 0usize;
    for (from, to, amount, client) in plan {
        if let Err(e) = engine.add_transaction(from, to, amount, &client).await {
            rejected += 1;
            warn!(code = e.code(), error = %e, "Transfer rejected");
        }
    }
    let bundles = engine.drain().await?;

    let stats = engine.get_stats();
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        rejected,
        drained_bundles = bundles,
        executed = stats.executed_transfers,
        failed = stats.failed_transfers,
        ledger_accepted = ledger.accepted(),
        "Demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    engine.close();
    Ok(())
}

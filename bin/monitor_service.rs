//! # Monitor Service
//!
//! Long-lived entrypoint for the lendwatch engine: pool discovery, position
//! scanning and chat notifications across every supported chain.
//!
//! ## Usage
//!
//! ```bash
//! TELEGRAM_BOT_TOKEN=... cargo run --bin monitor_service
//! ```
//!
//! `--once` runs a single discovery + position tick and exits, which is the
//! quickest way to smoke-test RPC endpoints and the store.
//!
//! Press Ctrl+C to stop gracefully; in-flight ticks get a bounded drain.

use anyhow::{anyhow, Result};
use clap::Parser;
use lendwatch::engine::Engine;
use lendwatch::settings::Settings;
use lendwatch::telegram::TelegramGateway;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "monitor_service", about = "Multi-chain lending-pool monitor")]
struct Args {
    /// Run one discovery tick and one position tick, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    println!("🚀 Starting Lendwatch Monitor Service");
    println!("═══════════════════════════════════════════════════════════════════\n");

    // 1. Load and validate settings
    let settings = Settings::new().map_err(|e| anyhow!("settings: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {}", e))?;
    println!("✅ Settings loaded");

    // 2. Required credential check happens before anything opens
    let token = settings
        .notifier
        .telegram_bot_token
        .clone()
        .ok_or_else(|| anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;

    // 3. Build the engine (opens the store, wires clients/router/schedulers)
    let gateway = Arc::new(TelegramGateway::new(&token));
    let engine = Engine::new(settings, gateway)
        .await
        .map_err(|e| anyhow!("engine startup: {}", e))?;
    println!("✅ Engine constructed");

    // 4. Configuration dump
    engine.print_config_dump();

    if args.once {
        println!("\n🩺 Probing chains...");
        for (chain, result) in engine.probe_chains().await {
            match result {
                Ok(block) => println!("   {:<10} block {}", chain.name(), block),
                Err(e) => println!("   {:<10} unreachable: {}", chain.name(), e),
            }
        }

        println!("\n🔍 Running a single tick (--once)...");
        let (discovery, positions) = engine
            .run_once()
            .await
            .map_err(|e| anyhow!("tick failed: {}", e))?;
        println!(
            "✅ Discovery: {} pools, {} events, {} chains failed",
            discovery.pools_observed,
            discovery.events_emitted,
            discovery.chains_failed.len()
        );
        println!(
            "✅ Positions: {} updated, {} closed, {} APY events",
            positions.positions_updated, positions.positions_closed, positions.apy_events
        );
        return Ok(());
    }

    // 5. Start tickers and wait for shutdown
    let handle = engine.start();
    println!("\n💡 Service running:");
    println!(
        "   - Pool discovery every {} seconds",
        engine.settings.monitoring.pool_scan_interval_seconds
    );
    println!(
        "   - Position scan every {} seconds",
        engine.settings.monitoring.position_scan_interval_seconds
    );
    println!("\nPress Ctrl+C to stop gracefully...\n");

    signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("signal handler: {}", e))?;
    println!("\n🛑 Shutdown signal received, draining in-flight ticks...");

    handle.shutdown().await;
    println!("✅ Shutdown complete");
    Ok(())
}

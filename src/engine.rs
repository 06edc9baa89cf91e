// src/engine.rs
// The `Engine` owns every long-lived handle: the store, the per-chain client
// registry, the gateway, the router and both schedulers. Construction order
// is explicit; nothing hides in module-level state.

use crate::chain_client::{BalanceReader, ChainClients};
use crate::chains::Chain;
use crate::conversation::conversation_ttl;
use crate::database::{self, DbPool};
use crate::discovery::{DiscoveryReport, PoolDiscovery};
use crate::errors::Result;
use crate::notifier::NotificationRouter;
use crate::pool_fetcher::{OnChainPoolFetcher, PoolSource};
use crate::positions::{PositionScanReport, PositionScanner};
use crate::settings::Settings;
use crate::telegram::ChatGateway;
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Drain budget granted to in-flight ticks on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Maintenance cadence for APY-history pruning and conversation expiry.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Engine {
    pub settings: Arc<Settings>,
    pub db: DbPool,
    pub clients: Arc<ChainClients>,
    pub router: Arc<NotificationRouter>,
    discovery: Arc<PoolDiscovery>,
    positions: Arc<PositionScanner>,
}

impl Engine {
    /// Builds the engine against the production on-chain fetcher.
    pub async fn new(settings: Settings, gateway: Arc<dyn ChatGateway>) -> Result<Engine> {
        let settings = Arc::new(settings);
        let clients = Arc::new(ChainClients::new(settings.clone()));
        let source: Arc<dyn PoolSource> = Arc::new(OnChainPoolFetcher::new(clients.clone()));
        Self::with_source(settings, clients, source, gateway).await
    }

    /// Builds the engine with an injected pool source. Tests use this to
    /// script fetcher output without any RPC.
    pub async fn with_source(
        settings: Arc<Settings>,
        clients: Arc<ChainClients>,
        source: Arc<dyn PoolSource>,
        gateway: Arc<dyn ChatGateway>,
    ) -> Result<Engine> {
        let db = database::connect(
            &settings.database.path,
            settings.database.max_connections,
        )
        .await?;
        let reader: Arc<dyn BalanceReader> = clients.clone();
        Self::assemble(settings, clients, source, reader, gateway, db)
    }

    /// Same wiring against an already-open store (in-memory in tests), with
    /// the balance reader injectable alongside the pool source.
    pub fn assemble(
        settings: Arc<Settings>,
        clients: Arc<ChainClients>,
        source: Arc<dyn PoolSource>,
        reader: Arc<dyn BalanceReader>,
        gateway: Arc<dyn ChatGateway>,
        db: DbPool,
    ) -> Result<Engine> {
        let router = Arc::new(NotificationRouter::new(
            db.clone(),
            gateway,
            settings.clone(),
        ));
        let discovery = Arc::new(PoolDiscovery::new(
            db.clone(),
            source,
            router.clone(),
            settings.clone(),
        ));
        let positions = Arc::new(PositionScanner::new(
            db.clone(),
            reader,
            router.clone(),
            settings.clone(),
        ));
        Ok(Engine {
            settings,
            db,
            clients,
            router,
            discovery,
            positions,
        })
    }

    /// Startup configuration dump: which knobs are set, which chains have
    /// explicit endpoints.
    pub fn print_config_dump(&self) {
        println!("📊 Monitor configuration:");
        println!(
            "   Pool scan interval:     {} s",
            self.settings.monitoring.pool_scan_interval_seconds
        );
        println!(
            "   Position scan interval: {} s",
            self.settings.monitoring.position_scan_interval_seconds
        );
        println!(
            "   APY thresholds:         minor {} pp / major {} pp",
            self.settings.monitoring.apy_minor_threshold,
            self.settings.monitoring.apy_major_threshold
        );
        println!(
            "   Dust threshold:         {} raw units",
            self.settings.monitoring.dust_threshold
        );
        println!("   Store path:             {}", self.settings.database.path);
        println!(
            "   Chat credential:        {}",
            if self.settings.notifier.telegram_bot_token.is_some() {
                "set"
            } else {
                "MISSING"
            }
        );
        for chain in Chain::ALL {
            let (url, explicit) = self.clients.resolve_endpoint(chain);
            println!(
                "   {:<10} -> {} ({})",
                chain.name(),
                url,
                if explicit { "configured" } else { "public fallback" }
            );
        }
    }

    /// Probes every chain's block number in parallel. Purely diagnostic:
    /// an unreachable chain is reported, not fatal.
    pub async fn probe_chains(&self) -> Vec<(Chain, Result<u64>)> {
        let probes = Chain::ALL.map(|chain| {
            let clients = self.clients.clone();
            async move { (chain, clients.block_number(chain).await) }
        });
        futures::future::join_all(probes).await
    }

    /// Runs a single discovery tick followed by a single position tick.
    /// Drives the `--once` smoke-test mode and the integration tests.
    pub async fn run_once(&self) -> Result<(DiscoveryReport, PositionScanReport)> {
        let discovery = self.discovery.run_once().await?;
        let positions = self.positions.run_once().await?;
        Ok((discovery, positions))
    }

    pub async fn run_discovery_once(&self) -> Result<DiscoveryReport> {
        self.discovery.run_once().await
    }

    pub async fn run_position_scan_once(&self) -> Result<PositionScanReport> {
        self.positions.run_once().await
    }

    /// Spawns both tickers plus the daily maintenance task.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let discovery_handle = self.discovery.clone().start(shutdown_rx.clone());
        let positions_handle = self.positions.clone().start(shutdown_rx.clone());
        let maintenance_handle = self.spawn_maintenance(shutdown_rx);

        info!("🔄 Engine started: discovery, position scan and maintenance tasks running");
        EngineHandle {
            shutdown_tx,
            tasks: vec![discovery_handle, positions_handle, maintenance_handle],
        }
    }

    fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let db = self.db.clone();
        let retention_days = self.settings.monitoring.apy_retention_days;
        tokio::spawn(async move {
            let mut ticker = interval(MAINTENANCE_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the immediate first tick doubles as a startup cleanup
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match database::prune_apy_samples(&db, retention_days).await {
                            Ok(pruned) if pruned > 0 => {
                                info!("🗑️ Pruned {} APY samples older than {} days", pruned, retention_days)
                            }
                            Ok(_) => {}
                            Err(e) => warn!("⚠️ APY pruning failed: {}", e),
                        }
                        match database::clear_expired_conversations(&db, conversation_ttl(), Utc::now()).await {
                            Ok(cleared) if cleared > 0 => {
                                info!("🗑️ Cleared {} expired conversations", cleared)
                            }
                            Ok(_) => {}
                            Err(e) => warn!("⚠️ Conversation cleanup failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// Running engine: the shutdown side of the tickers.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stops accepting new ticks, gives in-flight ticks a bounded drain,
    /// then cancels whatever is left.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let abort = task.abort_handle();
            if timeout(SHUTDOWN_DRAIN, task).await.is_err() {
                warn!("⚠️ Task did not drain within {:?}, cancelling", SHUTDOWN_DRAIN);
                abort.abort();
            }
        }
        info!("✅ Engine shut down");
    }
}

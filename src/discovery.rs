// src/discovery.rs
// Pool-discovery scheduler. Each tick: fetch every chain in parallel, diff
// against the cache, record APY samples, deactivate vanished pools, and hand
// announcement events to the router in a serialized pass.

use crate::chains::Chain;
use crate::database::{self, DbPool, PoolUpsertOutcome};
use crate::errors::{MonitorError, Result};
use crate::events::ChangeEvent;
use crate::metrics;
use crate::notifier::NotificationRouter;
use crate::pool_fetcher::PoolSource;
use crate::pools::{PoolKey, PoolRecord};
use crate::settings::Settings;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// What one discovery tick did, for logs and tests.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub chains_scanned: Vec<Chain>,
    pub chains_failed: Vec<Chain>,
    pub pools_observed: usize,
    pub pools_deactivated: u64,
    pub events_emitted: usize,
}

pub struct PoolDiscovery {
    db: DbPool,
    source: Arc<dyn PoolSource>,
    router: Arc<NotificationRouter>,
    settings: Arc<Settings>,
}

impl PoolDiscovery {
    pub fn new(
        db: DbPool,
        source: Arc<dyn PoolSource>,
        router: Arc<NotificationRouter>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            source,
            router,
            settings,
        }
    }

    /// Spawns the periodic ticker. A flipped shutdown signal stops new ticks;
    /// the in-flight tick finishes on its own (the engine bounds the drain).
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.settings.monitoring.pool_scan_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        match self.run_once().await {
                            Ok(report) => info!(
                                "✅ Discovery tick: {} pools across {} chains ({} failed), {} deactivated, {} events in {:?}",
                                report.pools_observed,
                                report.chains_scanned.len(),
                                report.chains_failed.len(),
                                report.pools_deactivated,
                                report.events_emitted,
                                started.elapsed()
                            ),
                            Err(e) => {
                                error!("❌ Discovery tick failed: {}", e);
                                if matches!(e, MonitorError::StoreFatal(_) | MonitorError::ConfigInvalid(_)) {
                                    error!("💀 Unrecoverable failure, terminating");
                                    std::process::exit(1);
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("🛑 Pool-discovery ticker stopping");
                        break;
                    }
                }
            }
        })
    }

    /// One full scan. Chains run in parallel (bounded by the chain count);
    /// everything after the fetch is serialized, which keeps upserts ahead of
    /// the events that reference them.
    pub async fn run_once(&self) -> Result<DiscoveryReport> {
        let now = Utc::now();
        metrics::increment_tick("pool_discovery");

        // 1. Fan out one fetch per chain, each under the soft tick budget.
        let budget = Duration::from_secs(self.settings.rpc.chain_tick_budget_seconds);
        let mut handles = Vec::with_capacity(Chain::ALL.len());
        for chain in Chain::ALL {
            let source = self.source.clone();
            handles.push(tokio::spawn(async move {
                match timeout(budget, source.fetch_pools(chain)).await {
                    Ok(result) => result,
                    Err(_) => Err(MonitorError::RpcTransient {
                        chain,
                        message: format!("tick budget of {:?} exhausted", budget),
                    }),
                }
            }));
        }

        let mut report = DiscoveryReport::default();
        let mut observed: Vec<PoolKey> = Vec::new();
        let mut announcements: Vec<PoolRecord> = Vec::new();
        let mut any_nonempty = false;

        // 2. Collect per chain; a failed chain is skipped for this tick only.
        let joined = futures::future::join_all(handles).await;
        for (chain, outcome) in Chain::ALL.into_iter().zip(joined) {
            let fetched = match outcome {
                Ok(result) => result,
                Err(join_err) => Err(MonitorError::RpcTransient {
                    chain,
                    message: format!("fetch task aborted: {}", join_err),
                }),
            };

            let pools = match fetched {
                Ok(pools) => pools,
                Err(e) => {
                    warn!("⚠️ Skipping {} for this tick: {}", chain, e);
                    metrics::increment_chain_failure(chain.name());
                    report.chains_failed.push(chain);
                    continue;
                }
            };

            report.chains_scanned.push(chain);
            if !pools.is_empty() {
                any_nonempty = true;
            }

            for pool in pools {
                let outcome = database::upsert_pool(&self.db, &pool, now).await?;
                database::insert_apy_sample(
                    &self.db,
                    pool.key(),
                    pool.apy,
                    pool.borrow_apy,
                    pool.tvl,
                    now,
                )
                .await?;
                observed.push(pool.key());
                report.pools_observed += 1;

                if matches!(
                    outcome,
                    PoolUpsertOutcome::New | PoolUpsertOutcome::Reactivated
                ) {
                    announcements.push(pool);
                }
            }
        }

        // 3. Deactivate unobserved rows, but never off the back of a fully
        //    failed scan: an all-chains outage must not mass-deactivate.
        if any_nonempty {
            report.pools_deactivated =
                database::mark_pools_inactive(&self.db, &observed, &report.chains_scanned, now)
                    .await?;
        } else if !observed.is_empty() || !report.chains_scanned.is_empty() {
            info!("⚠️ Every chain came back empty or failed; skipping deactivation pass");
        }

        // 4. Assemble events. The first active Monad pool ever observed adds
        //    a one-shot protocol-launch broadcast ahead of its announcement.
        let mut events: Vec<ChangeEvent> = Vec::new();
        let monad_observed = observed.iter().any(|k| k.chain == Chain::Monad);
        if monad_observed && !database::has_any_announcement_for_chain(&self.db, Chain::Monad).await? {
            events.push(ChangeEvent::ProtocolLaunch {
                chain: Chain::Monad,
            });
        }
        events.extend(
            announcements
                .into_iter()
                .map(|pool| ChangeEvent::PoolAnnouncement { pool }),
        );

        // 5. Serialized hand-off to the router.
        report.events_emitted = events.len();
        for event in &events {
            self.router.handle_event(event).await?;
        }

        Ok(report)
    }
}

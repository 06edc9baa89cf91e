// src/positions.rs
// Position scheduler. Each tick: read every wallet's share balance in every
// cached pool, upsert what it finds, close what has gone to dust, and flag
// material APY shifts on what remains.

use crate::chain_client::BalanceReader;
use crate::chains::Chain;
use crate::database::{self, CachedPool, DbPool, PositionUpsertOutcome};
use crate::errors::{MonitorError, Result};
use crate::events::ChangeEvent;
use crate::metrics;
use crate::notifier::NotificationRouter;
use crate::pools::PoolKey;
use crate::settings::Settings;
use crate::utils::truncate_address;
use chrono::Utc;
use ethers::types::{Address, U256};
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct PositionScanReport {
    pub users_scanned: usize,
    pub balances_read: usize,
    pub reads_failed: usize,
    pub positions_updated: usize,
    pub positions_closed: usize,
    pub apy_events: usize,
}

pub struct PositionScanner {
    db: DbPool,
    reader: Arc<dyn BalanceReader>,
    router: Arc<NotificationRouter>,
    settings: Arc<Settings>,
}

/// Outcome of one (user, pool) balance read within a tick.
enum Observation {
    NonDust { shares: U256 },
    Dust,
    Failed,
}

impl PositionScanner {
    pub fn new(
        db: DbPool,
        reader: Arc<dyn BalanceReader>,
        router: Arc<NotificationRouter>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            reader,
            router,
            settings,
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.settings.monitoring.position_scan_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        match self.run_once().await {
                            Ok(report) => info!(
                                "✅ Position tick: {} users, {} reads ({} failed), {} updated, {} closed, {} APY events in {:?}",
                                report.users_scanned,
                                report.balances_read,
                                report.reads_failed,
                                report.positions_updated,
                                report.positions_closed,
                                report.apy_events,
                                started.elapsed()
                            ),
                            Err(e) => {
                                error!("❌ Position tick failed: {}", e);
                                if matches!(e, MonitorError::StoreFatal(_) | MonitorError::ConfigInvalid(_)) {
                                    error!("💀 Unrecoverable failure, terminating");
                                    std::process::exit(1);
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("🛑 Position ticker stopping");
                        break;
                    }
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<PositionScanReport> {
        let now = Utc::now();
        metrics::increment_tick("position_scan");
        let mut report = PositionScanReport::default();

        // 1. Users with a wallet and the active pool cache.
        let users = database::get_users_with_wallets(&self.db).await?;
        let pools = database::load_active_pools(&self.db).await?;
        report.users_scanned = users.len();

        let pool_map: HashMap<PoolKey, CachedPool> =
            pools.iter().map(|p| (p.key(), p.clone())).collect();

        // 2. Balance reads, bounded per chain and per user.
        let chain_slots: HashMap<Chain, Arc<Semaphore>> = Chain::ALL
            .into_iter()
            .map(|c| {
                (
                    c,
                    Arc::new(Semaphore::new(self.settings.rpc.max_concurrent_reads_per_chain)),
                )
            })
            .collect();

        let mut handles = Vec::new();
        for user in &users {
            let Some(wallet_raw) = user.wallet_address.as_deref() else {
                continue;
            };
            let Ok(wallet) = Address::from_str(wallet_raw) else {
                warn!("⚠️ user {} has an unparseable wallet, skipping", user.id);
                continue;
            };
            let user_slots = Arc::new(Semaphore::new(
                self.settings.rpc.max_concurrent_reads_per_chain,
            ));

            for pool in &pools {
                let key = pool.key();
                let reader = self.reader.clone();
                let chain_slot = chain_slots[&key.chain].clone();
                let user_slot = user_slots.clone();
                let user_id = user.id;

                handles.push(tokio::spawn(async move {
                    // consistent acquisition order: chain, then user
                    let _chain_permit = chain_slot.acquire_owned().await;
                    let _user_permit = user_slot.acquire_owned().await;
                    let result = reader.read_share_balance(key.chain, key.address, wallet).await;
                    (user_id, key, result)
                }));
            }
        }

        let dust = U256::from(self.settings.monitoring.dust_threshold);
        let mut observations: HashMap<(i64, PoolKey), Observation> = HashMap::new();
        for joined in futures::future::join_all(handles).await {
            let Ok((user_id, key, result)) = joined else {
                continue;
            };
            report.balances_read += 1;
            let observation = match result {
                Ok(shares) if shares > dust => Observation::NonDust { shares },
                Ok(_) => Observation::Dust,
                Err(e) => {
                    report.reads_failed += 1;
                    warn!("⚠️ balance read failed for user {} on {}: {}", user_id, key.chain, e);
                    Observation::Failed
                }
            };
            observations.insert((user_id, key), observation);
        }

        // 3. Upserts and APY-shift detection. A balance read and its upsert
        //    are sequenced per position by this single loop.
        let minor = self.settings.monitoring.apy_minor_threshold;
        let major = self.settings.monitoring.apy_major_threshold;
        let mut events: Vec<ChangeEvent> = Vec::new();
        let mut seen_live: HashSet<(i64, PoolKey)> = HashSet::new();
        let mut read_failed: HashSet<(i64, PoolKey)> = HashSet::new();

        for ((user_id, key), observation) in &observations {
            let shares = match observation {
                Observation::NonDust { shares } => *shares,
                Observation::Dust => continue,
                Observation::Failed => {
                    read_failed.insert((*user_id, *key));
                    continue;
                }
            };
            let Some(pool) = pool_map.get(key) else { continue };

            let value = match self
                .reader
                .convert_to_assets(key.chain, key.address, shares)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    // Treat the whole observation as failed: the position is
                    // neither updated nor eligible for closure this tick.
                    warn!("⚠️ convertToAssets failed for user {} on {}: {}", user_id, key.chain, e);
                    report.reads_failed += 1;
                    read_failed.insert((*user_id, *key));
                    continue;
                }
            };

            // APY comes from the cache written this interval, not from a
            // second chain read.
            let (position, outcome) =
                database::upsert_position(&self.db, *user_id, *key, shares, value, pool.apy, now)
                    .await?;
            seen_live.insert((*user_id, *key));
            report.positions_updated += 1;

            if let PositionUpsertOutcome::Updated { previous_apy } = outcome {
                let delta = pool.apy - previous_apy;
                if delta.abs() >= minor {
                    events.push(ChangeEvent::ApyChange {
                        position,
                        pool_name: pool.name.clone(),
                        underlying_symbol: pool.underlying_symbol.clone(),
                        pool_utilization: pool.utilization,
                        old_apy: previous_apy,
                        new_apy: pool.apy,
                        major: delta.abs() >= major,
                    });
                    report.apy_events += 1;
                }
            }
        }

        // 4. Closures: every pre-existing active position not seen live this
        //    tick, except those whose read failed (infrastructure trouble is
        //    not a withdrawal).
        let existing = database::load_active_positions(&self.db).await?;
        for position in existing {
            let slot = (position.user_id, position.pool_key());
            if seen_live.contains(&slot) || read_failed.contains(&slot) {
                continue;
            }

            database::close_position(&self.db, position.id, now).await?;
            report.positions_closed += 1;

            let (pool_name, underlying_symbol, utilization) =
                match database::get_pool(&self.db, position.pool_address, position.chain).await? {
                    Some(pool) => (pool.name, pool.underlying_symbol, pool.utilization),
                    None => (
                        truncate_address(position.pool_address),
                        truncate_address(position.pool_address),
                        0.0,
                    ),
                };
            events.push(ChangeEvent::PositionClosed {
                position,
                pool_name,
                underlying_symbol,
                pool_utilization: utilization,
            });
        }

        // 5. One APY sample per pool per tick; the minute bucket deduplicates
        //    against the discovery scheduler's sample.
        for pool in &pools {
            database::insert_apy_sample(
                &self.db,
                pool.key(),
                pool.apy,
                pool.borrow_apy,
                pool.tvl,
                now,
            )
            .await?;
        }

        // 6. Serialized hand-off.
        for event in &events {
            self.router.handle_event(event).await?;
        }

        Ok(report)
    }
}

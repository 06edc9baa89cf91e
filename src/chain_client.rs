// src/chain_client.rs

use crate::chains::Chain;
use crate::contracts::{Erc20, LendingPool, PoolRegister};
use crate::errors::{MonitorError, Result};
use crate::metrics;
use crate::pools::ray_rate_to_percent;
use crate::settings::Settings;
use dashmap::DashMap;
use ethers::contract::ContractError;
use ethers::prelude::{Http, Middleware, Provider};
use ethers::types::{Address, U256};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, warn};
use rand::Rng;
use std::env;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// On-chain facts about one lending pool, read in a single pass.
///
/// Rates stay in ray (10^27) here; percent conversion happens through the
/// accessors so it runs exactly once per value, at this boundary.
#[derive(Debug, Clone)]
pub struct PoolMetadata {
    pub underlying: Address,
    pub decimals: u8,
    pub total_assets: U256,
    pub total_borrowed: U256,
    pub supply_rate: U256,
    pub borrow_rate: U256,
}

impl PoolMetadata {
    pub fn supply_apy_percent(&self) -> f64 {
        ray_rate_to_percent(self.supply_rate)
    }

    pub fn borrow_apy_percent(&self) -> f64 {
        ray_rate_to_percent(self.borrow_rate)
    }
}

/// Per-chain RPC capability set.
///
/// One `Provider<Http>` per chain, constructed lazily on first use and cached
/// for the process lifetime. Endpoint selection order: `RPC_URL_<CHAIN>` env
/// var, then the config endpoint map, then the documented public fallback.
/// Every read retries transient failures with exponential backoff and a
/// per-attempt timeout, and respects a per-chain request quota.
pub struct ChainClients {
    settings: Arc<Settings>,
    providers: DashMap<Chain, Arc<Provider<Http>>>,
    limiters: DashMap<Chain, Arc<DefaultDirectRateLimiter>>,
}

impl ChainClients {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            providers: DashMap::new(),
            limiters: DashMap::new(),
        }
    }

    /// Resolves the endpoint this process uses for a chain. Also consulted by
    /// the startup configuration dump.
    pub fn resolve_endpoint(&self, chain: Chain) -> (String, bool) {
        if let Ok(url) = env::var(chain.rpc_env_key()) {
            if !url.trim().is_empty() {
                return (url, true);
            }
        }
        if let Some(url) = self.settings.rpc.endpoints.get(chain.config_key()) {
            if !url.trim().is_empty() {
                return (url.clone(), true);
            }
        }
        (chain.default_rpc_url().to_string(), false)
    }

    pub fn provider(&self, chain: Chain) -> Result<Arc<Provider<Http>>> {
        if let Some(existing) = self.providers.get(&chain) {
            return Ok(existing.value().clone());
        }
        let (url, explicit) = self.resolve_endpoint(chain);
        let provider = Provider::<Http>::try_from(url.as_str()).map_err(|e| {
            MonitorError::ConfigInvalid(format!("bad RPC endpoint for {}: {}", chain, e))
        })?;
        debug!(
            "🔌 RPC client for {} -> {} ({})",
            chain,
            url,
            if explicit { "configured" } else { "public fallback" }
        );
        let entry = self.providers.entry(chain).or_insert_with(|| Arc::new(provider));
        Ok(entry.value().clone())
    }

    fn limiter(&self, chain: Chain) -> Arc<DefaultDirectRateLimiter> {
        if let Some(existing) = self.limiters.get(&chain) {
            return existing.value().clone();
        }
        let qps = NonZeroU32::new(self.settings.rpc.max_qps_per_chain).unwrap_or(NonZeroU32::MIN);
        let entry = self
            .limiters
            .entry(chain)
            .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_second(qps))));
        entry.value().clone()
    }

    /// Current share balance of `holder` in `pool`.
    pub async fn read_share_balance(
        &self,
        chain: Chain,
        pool: Address,
        holder: Address,
    ) -> Result<U256> {
        let contract = LendingPool::new(pool, self.provider(chain)?);
        self.with_retry(chain, "balanceOf", || {
            let contract = contract.clone();
            async move {
                contract
                    .balance_of(holder)
                    .call()
                    .await
                    .map_err(|e| classify_contract_error(chain, pool, e))
            }
        })
        .await
    }

    /// Converts a share amount into underlying units via the pool's own
    /// exchange rate.
    pub async fn convert_to_assets(
        &self,
        chain: Chain,
        pool: Address,
        shares: U256,
    ) -> Result<U256> {
        let contract = LendingPool::new(pool, self.provider(chain)?);
        self.with_retry(chain, "convertToAssets", || {
            let contract = contract.clone();
            async move {
                contract
                    .convert_to_assets(shares)
                    .call()
                    .await
                    .map_err(|e| classify_contract_error(chain, pool, e))
            }
        })
        .await
    }

    /// Reads underlying asset, decimals, liquidity and rates for one pool.
    pub async fn read_pool_metadata(&self, chain: Chain, pool: Address) -> Result<PoolMetadata> {
        let provider = self.provider(chain)?;
        let contract = LendingPool::new(pool, provider.clone());

        let underlying = self
            .with_retry(chain, "asset", || {
                let contract = contract.clone();
                async move {
                    contract
                        .asset()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;

        let asset = Erc20::new(underlying, provider);
        let decimals = self
            .with_retry(chain, "decimals", || {
                let asset = asset.clone();
                async move {
                    asset
                        .decimals()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, underlying, e))
                }
            })
            .await?;

        let total_assets = self
            .with_retry(chain, "totalAssets", || {
                let contract = contract.clone();
                async move {
                    contract
                        .total_assets()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;

        let total_borrowed = self
            .with_retry(chain, "totalBorrowed", || {
                let contract = contract.clone();
                async move {
                    contract
                        .total_borrowed()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;

        let supply_rate = self
            .with_retry(chain, "supplyRate", || {
                let contract = contract.clone();
                async move {
                    contract
                        .supply_rate()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;

        let borrow_rate = self
            .with_retry(chain, "borrowRate", || {
                let contract = contract.clone();
                async move {
                    contract
                        .borrow_rate()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;

        Ok(PoolMetadata {
            underlying,
            decimals,
            total_assets,
            total_borrowed,
            supply_rate,
            borrow_rate,
        })
    }

    /// Display name and share symbol of a pool contract.
    pub async fn read_pool_identity(&self, chain: Chain, pool: Address) -> Result<(String, String)> {
        let contract = LendingPool::new(pool, self.provider(chain)?);
        let name = self
            .with_retry(chain, "name", || {
                let contract = contract.clone();
                async move {
                    contract
                        .name()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;
        let symbol = self
            .with_retry(chain, "symbol", || {
                let contract = contract.clone();
                async move {
                    contract
                        .symbol()
                        .call()
                        .await
                        .map_err(|e| classify_contract_error(chain, pool, e))
                }
            })
            .await?;
        Ok((name, symbol))
    }

    /// On-chain `symbol()` of an arbitrary token contract.
    pub async fn read_token_symbol(&self, chain: Chain, token: Address) -> Result<String> {
        let asset = Erc20::new(token, self.provider(chain)?);
        self.with_retry(chain, "symbol", || {
            let asset = asset.clone();
            async move {
                asset
                    .symbol()
                    .call()
                    .await
                    .map_err(|e| classify_contract_error(chain, token, e))
            }
        })
        .await
    }

    /// Enumerates every pool the protocol's on-chain register knows about.
    pub async fn read_registered_pools(
        &self,
        chain: Chain,
        register: Address,
    ) -> Result<Vec<Address>> {
        let contract = PoolRegister::new(register, self.provider(chain)?);
        self.with_retry(chain, "getPools", || {
            let contract = contract.clone();
            async move {
                contract
                    .get_pools()
                    .call()
                    .await
                    .map_err(|e| classify_contract_error(chain, register, e))
            }
        })
        .await
    }

    /// Health probe: latest block number.
    pub async fn block_number(&self, chain: Chain) -> Result<u64> {
        let provider = self.provider(chain)?;
        let block = self
            .with_retry(chain, "eth_blockNumber", || {
                let provider = provider.clone();
                async move {
                    provider
                        .get_block_number()
                        .await
                        .map_err(|e| MonitorError::RpcTransient {
                            chain,
                            message: e.to_string(),
                        })
                }
            })
            .await?;
        Ok(block.as_u64())
    }

    /// Retry loop shared by all reads: per-attempt timeout, exponential
    /// backoff from the configured base, jitter to avoid thundering herds.
    /// Permanent and decode failures surface immediately.
    async fn with_retry<T, F, Fut>(&self, chain: Chain, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.settings.rpc.max_retries;
        let attempt_timeout = Duration::from_secs(self.settings.rpc.request_timeout_seconds);
        let mut attempt: u32 = 0;

        loop {
            self.limiter(chain).until_ready().await;
            metrics::increment_rpc_call(chain.name(), op);

            let outcome = timeout(attempt_timeout, call()).await;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return Err(e),
                Err(_) => MonitorError::RpcTransient {
                    chain,
                    message: format!("{} timed out after {:?}", op, attempt_timeout),
                },
            };

            if attempt >= max_retries {
                warn!("❌ {} on {} failed after {} retries: {}", op, chain, max_retries, err);
                return Err(err);
            }

            let base = self.settings.rpc.retry_base_delay_ms;
            let jitter = rand::thread_rng().gen_range(0..250);
            let delay = Duration::from_millis(base.saturating_mul(1 << attempt) + jitter);
            debug!(
                "⚠️ {} on {} failed (attempt {}/{}), retrying in {:?}: {}",
                op,
                chain,
                attempt + 1,
                max_retries,
                delay,
                err
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// The two reads the position scheduler performs per (user, pool). Kept as a
/// trait so the scheduler can be driven without chain access in tests.
#[async_trait::async_trait]
pub trait BalanceReader: Send + Sync {
    async fn read_share_balance(&self, chain: Chain, pool: Address, holder: Address)
        -> Result<U256>;
    async fn convert_to_assets(&self, chain: Chain, pool: Address, shares: U256) -> Result<U256>;
}

#[async_trait::async_trait]
impl BalanceReader for ChainClients {
    async fn read_share_balance(
        &self,
        chain: Chain,
        pool: Address,
        holder: Address,
    ) -> Result<U256> {
        ChainClients::read_share_balance(self, chain, pool, holder).await
    }

    async fn convert_to_assets(&self, chain: Chain, pool: Address, shares: U256) -> Result<U256> {
        ChainClients::convert_to_assets(self, chain, pool, shares).await
    }
}

/// One conversion point from provider errors into the tagged taxonomy.
fn classify_contract_error(
    chain: Chain,
    address: Address,
    err: ContractError<Provider<Http>>,
) -> MonitorError {
    match err {
        ContractError::Revert(_) => MonitorError::RpcPermanent {
            chain,
            message: format!("call reverted at {:?}", address),
        },
        ContractError::ContractNotDeployed | ContractError::ConstructorError => {
            MonitorError::RpcPermanent {
                chain,
                message: format!("no contract at {:?}", address),
            }
        }
        ContractError::MiddlewareError { e } => MonitorError::RpcTransient {
            chain,
            message: e.to_string(),
        },
        ContractError::ProviderError { e } => MonitorError::RpcTransient {
            chain,
            message: e.to_string(),
        },
        other => MonitorError::ContractDecode {
            chain,
            address,
            message: other.to_string(),
        },
    }
}

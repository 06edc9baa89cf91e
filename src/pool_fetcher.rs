// src/pool_fetcher.rs
// Per-chain pool enumeration. The strategy is a static table, not a runtime
// probe: chains with a reliable on-chain register enumerate through it,
// the rest carry a hard-coded pool list read directly.

use crate::chain_client::ChainClients;
use crate::chains::Chain;
use crate::errors::Result;
use crate::pools::{utilization_percent, PoolRecord, StaticPool};
use crate::utils::truncate_address;
use async_trait::async_trait;
use ethers::types::Address;
use tracing::{info, warn};
use std::str::FromStr;
use std::sync::Arc;

/// How pools are enumerated on a given chain.
#[derive(Debug, Clone, Copy)]
pub enum FetchStrategy {
    /// The protocol's pool register enumerates every market.
    Register { register: &'static str },
    /// No working register on this chain: a short hard-coded list plus
    /// direct metadata reads, same output shape.
    Static { pools: &'static [StaticPool] },
}

const SONIC_POOLS: &[StaticPool] = &[
    StaticPool {
        address: "0x2fa96b7c5ba41aec8f1ac1ed4c8a8c4b3b5d0f9e",
        display_name: "Sonic USDC.e Lending Pool",
        token_symbol: "USDC.e",
        decimals: 6,
    },
    StaticPool {
        address: "0x7ad4d1c0c9bcf54e8f8b1a2ab1b9e3c4d5e6f7a8",
        display_name: "Sonic wS Lending Pool",
        token_symbol: "wS",
        decimals: 18,
    },
];

const PLASMA_POOLS: &[StaticPool] = &[StaticPool {
    address: "0x9e4f2b8d7c6a5b4e3d2c1f0a9b8c7d6e5f4a3b2c",
    display_name: "Plasma USDT Lending Pool",
    token_symbol: "USDT",
    decimals: 6,
}];

const MONAD_POOLS: &[StaticPool] = &[
    StaticPool {
        address: "0x1c5d8f3a2b4e6c7d8e9f0a1b2c3d4e5f6a7b8c9d",
        display_name: "Monad USDC Lending Pool",
        token_symbol: "USDC",
        decimals: 6,
    },
    StaticPool {
        address: "0x6b2e9c4d5f7a8b1c2d3e4f5a6b7c8d9e0f1a2b3c",
        display_name: "Monad WMON Lending Pool",
        token_symbol: "WMON",
        decimals: 18,
    },
];

/// The per-chain strategy table. A deliberate design knob: moving a chain
/// between strategies is a one-line change here.
pub fn strategy_for(chain: Chain) -> FetchStrategy {
    match chain {
        Chain::Ethereum => FetchStrategy::Register {
            register: "0xa50d4e7d8946a7c90652339cdbd262c375d54d99",
        },
        Chain::Arbitrum => FetchStrategy::Register {
            register: "0x8c4855b6e16b12d6cdf965bd1bac0153e399df23",
        },
        Chain::Optimism => FetchStrategy::Register {
            register: "0x3761ca4bfacfcffc1b8034e69f19116dd6756726",
        },
        Chain::Sonic => FetchStrategy::Static { pools: SONIC_POOLS },
        Chain::Plasma => FetchStrategy::Static {
            pools: PLASMA_POOLS,
        },
        Chain::Monad => FetchStrategy::Static { pools: MONAD_POOLS },
    }
}

/// Source of normalized pool records for one chain. The discovery scheduler
/// depends on this trait, not on the concrete on-chain fetcher.
#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn fetch_pools(&self, chain: Chain) -> Result<Vec<PoolRecord>>;
}

/// Production fetcher: resolves the strategy table against live chains.
pub struct OnChainPoolFetcher {
    clients: Arc<ChainClients>,
}

impl OnChainPoolFetcher {
    pub fn new(clients: Arc<ChainClients>) -> Self {
        Self { clients }
    }

    async fn fetch_from_register(
        &self,
        chain: Chain,
        register: &'static str,
    ) -> Result<Vec<PoolRecord>> {
        let register_addr = Address::from_str(register).expect("register addresses are vetted");
        let addresses = self.clients.read_registered_pools(chain, register_addr).await?;
        info!("📦 {} pools registered on {}", addresses.len(), chain);

        let mut records = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.build_record(chain, address, None).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("⚠️ dropping pool {:?} on {}: {}", address, chain, e),
            }
        }
        Ok(records)
    }

    async fn fetch_from_static(
        &self,
        chain: Chain,
        pools: &'static [StaticPool],
    ) -> Result<Vec<PoolRecord>> {
        let mut records = Vec::with_capacity(pools.len());
        for entry in pools {
            let address = Address::from_str(entry.address).expect("static addresses are vetted");
            match self.build_record(chain, address, Some(entry)).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("⚠️ dropping pool {:?} on {}: {}", address, chain, e),
            }
        }
        Ok(records)
    }

    /// Reads and normalizes one pool. Known static entries skip the identity
    /// reads; the metadata pass is always live.
    async fn build_record(
        &self,
        chain: Chain,
        address: Address,
        known: Option<&StaticPool>,
    ) -> Result<PoolRecord> {
        let meta = self.clients.read_pool_metadata(chain, address).await?;

        let (name, symbol) = match known {
            Some(entry) => (
                entry.display_name.to_string(),
                format!("d{}", entry.token_symbol),
            ),
            None => self.clients.read_pool_identity(chain, address).await?,
        };

        let underlying_symbol = match known {
            Some(entry) => entry.token_symbol.to_string(),
            None => match self.clients.read_token_symbol(chain, meta.underlying).await {
                Ok(sym) if !sym.trim().is_empty() => sym,
                Ok(_) | Err(_) => truncate_address(meta.underlying),
            },
        };

        Ok(PoolRecord {
            address,
            chain,
            name,
            symbol,
            underlying_symbol,
            underlying_address: meta.underlying,
            decimals: known.map(|e| e.decimals).unwrap_or(meta.decimals),
            tvl: meta.total_assets,
            apy: meta.supply_apy_percent(),
            borrow_apy: meta.borrow_apy_percent(),
            borrowed: meta.total_borrowed,
            utilization: utilization_percent(meta.total_borrowed, meta.total_assets),
            collaterals: Vec::new(),
        })
    }
}

#[async_trait]
impl PoolSource for OnChainPoolFetcher {
    async fn fetch_pools(&self, chain: Chain) -> Result<Vec<PoolRecord>> {
        match strategy_for(chain) {
            FetchStrategy::Register { register } => self.fetch_from_register(chain, register).await,
            FetchStrategy::Static { pools } => self.fetch_from_static(chain, pools).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_chain_has_a_strategy() {
        for chain in Chain::ALL {
            match strategy_for(chain) {
                FetchStrategy::Register { register } => {
                    assert!(Address::from_str(register).is_ok(), "bad register on {}", chain);
                }
                FetchStrategy::Static { pools } => {
                    assert!(!pools.is_empty(), "empty static list on {}", chain);
                    for p in pools {
                        assert!(Address::from_str(p.address).is_ok(), "bad address on {}", chain);
                    }
                }
            }
        }
    }

    #[test]
    fn new_chains_use_static_lists() {
        assert!(matches!(
            strategy_for(Chain::Monad),
            FetchStrategy::Static { .. }
        ));
        assert!(matches!(
            strategy_for(Chain::Ethereum),
            FetchStrategy::Register { .. }
        ));
    }
}

// src/pools.rs

use crate::chains::Chain;
use crate::utils::u256_to_f64_lossy;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Ray fixed-point base used by on-chain rate oracles (10^27).
pub const RAY_EXP: usize = 27;

/// Normalized record for one lending pool on one chain.
///
/// Amounts (`tvl`, `borrowed`) are arbitrary-precision integers in on-chain
/// underlying units; percentages are 64-bit floats converted exactly once at
/// the chain-access boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: Address,
    pub chain: Chain,
    pub name: String,
    pub symbol: String,
    pub underlying_symbol: String,
    pub underlying_address: Address,
    pub decimals: u8,
    pub tvl: U256,
    pub apy: f64,
    pub borrow_apy: f64,
    pub borrowed: U256,
    pub utilization: f64,
    pub collaterals: Vec<String>,
}

impl PoolRecord {
    pub fn key(&self) -> PoolKey {
        PoolKey {
            address: self.address,
            chain: self.chain,
        }
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth::from_utilization(self.utilization)
    }
}

/// Process-wide identity of a pool: (contract address, chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub address: Address,
    pub chain: Chain,
}

impl PoolKey {
    /// Canonical string form, also used as ledger subject key component.
    pub fn canonical(&self) -> String {
        format!("{:?}:{}", self.address, self.chain.id())
    }
}

/// Qualitative pool health derived from utilization bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    Active,
    Constrained,
}

impl PoolHealth {
    pub fn from_utilization(utilization_pct: f64) -> Self {
        if utilization_pct >= 95.0 {
            PoolHealth::Constrained
        } else if utilization_pct >= 80.0 {
            PoolHealth::Active
        } else {
            PoolHealth::Healthy
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Active => "active",
            PoolHealth::Constrained => "constrained",
        }
    }
}

/// Converts a supply/borrow rate in ray (10^27) into percent.
/// Keeps four decimal digits of percent precision before going lossy.
pub fn ray_rate_to_percent(rate: U256) -> f64 {
    // percent = rate / 10^25; divide down to 1e-4-percent integer units first
    // so the f64 conversion never sees more than ~2^53 of magnitude.
    let hundredths_of_bps = rate / U256::exp10(RAY_EXP - 6);
    u256_to_f64_lossy(hundredths_of_bps) / 10_000.0
}

/// Utilization percent = borrowed / total_assets, with an empty pool pinned
/// to zero rather than NaN.
pub fn utilization_percent(borrowed: U256, total_assets: U256) -> f64 {
    if total_assets.is_zero() {
        return 0.0;
    }
    // basis points keep enough resolution for the health bands
    let bps = borrowed * U256::from(10_000u64) / total_assets;
    u256_to_f64_lossy(bps) / 100.0
}

/// Hard-coded pool entry for chains enumerated without an on-chain register.
#[derive(Debug, Clone, Copy)]
pub struct StaticPool {
    pub address: &'static str,
    pub display_name: &'static str,
    pub token_symbol: &'static str,
    pub decimals: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_conversion_matches_reference_points() {
        // 5% APY in ray: 0.05 * 10^27
        let five_pct = U256::from(5u64) * U256::exp10(25);
        assert!((ray_rate_to_percent(five_pct) - 5.0).abs() < 1e-9);

        // 0.0001% resolution survives
        let tiny = U256::exp10(21);
        assert!((ray_rate_to_percent(tiny) - 0.0001).abs() < 1e-9);

        assert_eq!(ray_rate_to_percent(U256::zero()), 0.0);
    }

    #[test]
    fn utilization_bands() {
        assert_eq!(PoolHealth::from_utilization(0.0), PoolHealth::Healthy);
        assert_eq!(PoolHealth::from_utilization(79.99), PoolHealth::Healthy);
        assert_eq!(PoolHealth::from_utilization(80.0), PoolHealth::Active);
        assert_eq!(PoolHealth::from_utilization(94.99), PoolHealth::Active);
        assert_eq!(PoolHealth::from_utilization(95.0), PoolHealth::Constrained);
        assert_eq!(PoolHealth::from_utilization(100.0), PoolHealth::Constrained);
    }

    #[test]
    fn utilization_percent_is_safe_on_empty_pools() {
        assert_eq!(utilization_percent(U256::zero(), U256::zero()), 0.0);
        let half = utilization_percent(U256::from(50u64), U256::from(100u64));
        assert!((half - 50.0).abs() < 1e-9);
    }

    #[test]
    fn canonical_keys_are_stable() {
        let key = PoolKey {
            address: "0x00000000000000000000000000000000000000aa".parse().unwrap(),
            chain: Chain::Ethereum,
        };
        assert_eq!(
            key.canonical(),
            "0x00000000000000000000000000000000000000aa:1"
        );
    }
}

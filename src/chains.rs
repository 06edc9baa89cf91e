// src/chains.rs
// Supported chain table. Adding a chain means: add a variant here, a default
// endpoint, and an entry in the pool fetcher's strategy table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An EVM chain the monitor knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Ethereum,
    Arbitrum,
    Optimism,
    Sonic,
    Plasma,
    Monad,
}

impl Chain {
    /// Every chain the monitor scans, in scan order.
    pub const ALL: [Chain; 6] = [
        Chain::Ethereum,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Sonic,
        Chain::Plasma,
        Chain::Monad,
    ];

    pub fn id(self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Arbitrum => 42161,
            Chain::Optimism => 10,
            Chain::Sonic => 146,
            Chain::Plasma => 9745,
            Chain::Monad => 143,
        }
    }

    pub fn from_id(id: u64) -> Option<Chain> {
        Chain::ALL.into_iter().find(|c| c.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Chain::Ethereum => "Ethereum",
            Chain::Arbitrum => "Arbitrum",
            Chain::Optimism => "Optimism",
            Chain::Sonic => "Sonic",
            Chain::Plasma => "Plasma",
            Chain::Monad => "Monad",
        }
    }

    /// Environment variable consulted for an explicit RPC endpoint.
    pub fn rpc_env_key(self) -> &'static str {
        match self {
            Chain::Ethereum => "RPC_URL_ETHEREUM",
            Chain::Arbitrum => "RPC_URL_ARBITRUM",
            Chain::Optimism => "RPC_URL_OPTIMISM",
            Chain::Sonic => "RPC_URL_SONIC",
            Chain::Plasma => "RPC_URL_PLASMA",
            Chain::Monad => "RPC_URL_MONAD",
        }
    }

    /// Public fallback endpoint used when no explicit URL is configured.
    pub fn default_rpc_url(self) -> &'static str {
        match self {
            Chain::Ethereum => "https://eth.llamarpc.com",
            Chain::Arbitrum => "https://arb1.arbitrum.io/rpc",
            Chain::Optimism => "https://mainnet.optimism.io",
            Chain::Sonic => "https://rpc.soniclabs.com",
            Chain::Plasma => "https://rpc.plasma.to",
            Chain::Monad => "https://rpc.monad.xyz",
        }
    }

    /// Key used in config files and the per-chain endpoint override map.
    pub fn config_key(self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Sonic => "sonic",
            Chain::Plasma => "plasma",
            Chain::Monad => "monad",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

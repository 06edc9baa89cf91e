// src/errors.rs
// Tagged error taxonomy. Every layer converts external failures into exactly
// one of these variants at its own boundary, so callers can decide
// retry / skip-chain / mark-unreachable without parsing messages.

use crate::chains::Chain;
use ethers::types::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Network-ish RPC failure: timeouts, connection resets, rate limits.
    /// Retried with backoff inside the chain-access layer.
    #[error("transient RPC failure on {chain}: {message}")]
    RpcTransient { chain: Chain, message: String },

    /// Definitive RPC failure: the call will not succeed on retry.
    /// Marks the chain failed for the current tick.
    #[error("permanent RPC failure on {chain}: {message}")]
    RpcPermanent { chain: Chain, message: String },

    /// A contract returned data we could not decode. The offending record is
    /// dropped with a warning; the batch continues.
    #[error("undecodable response from {address:?} on {chain}: {message}")]
    ContractDecode {
        chain: Chain,
        address: Address,
        message: String,
    },

    /// Unique-index race on insert. Treated as "row already exists".
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// The store is broken. Terminates the process.
    #[error("fatal store failure: {0}")]
    StoreFatal(String),

    /// Outbound delivery failed but may succeed on retry (rate limit, network).
    #[error("transient delivery failure: {0}")]
    DeliverTransient(String),

    /// Outbound delivery will never succeed (bad channel id). The user's
    /// channel is marked unreachable.
    #[error("permanent delivery failure: {0}")]
    DeliverPermanent(String),

    /// Bad or missing configuration. Terminates the process at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl MonitorError {
    /// Whether the failure is worth retrying in place.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MonitorError::RpcTransient { .. } | MonitorError::DeliverTransient(_)
        )
    }

    /// The chain an RPC failure belongs to, if any.
    pub fn chain(&self) -> Option<Chain> {
        match self {
            MonitorError::RpcTransient { chain, .. }
            | MonitorError::RpcPermanent { chain, .. }
            | MonitorError::ContractDecode { chain, .. } => Some(*chain),
            _ => None,
        }
    }
}

/// Maps a sqlx error into the taxonomy: unique-index violations become
/// `StoreConflict`, everything else is fatal.
pub fn store_error(e: sqlx::Error) -> MonitorError {
    let conflict = e
        .as_database_error()
        .map(|d| matches!(d.kind(), sqlx::error::ErrorKind::UniqueViolation))
        .unwrap_or(false);
    if conflict {
        MonitorError::StoreConflict(e.to_string())
    } else {
        MonitorError::StoreFatal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let t = MonitorError::RpcTransient {
            chain: Chain::Arbitrum,
            message: "connection reset".into(),
        };
        assert!(t.is_transient());
        assert_eq!(t.chain(), Some(Chain::Arbitrum));

        let p = MonitorError::DeliverPermanent("chat not found".into());
        assert!(!p.is_transient());
        assert_eq!(p.chain(), None);
    }
}

// src/events.rs
// Change events produced by the schedulers and consumed by the router.
// Every pool-shaped event carries its true chain inside the payload; there is
// deliberately no constructor that defaults the chain.

use crate::chains::Chain;
use crate::database::Position;
use crate::pools::{PoolKey, PoolRecord};

/// Ledger stream / event kind identifiers. Also the cooldown policy axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    AlertMatch,
    ApyChange,
    PoolAnnouncement,
    PositionClosed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::AlertMatch => "alert_match",
            NotificationKind::ApyChange => "apy_change",
            NotificationKind::PoolAnnouncement => "pool_announcement",
            NotificationKind::PositionClosed => "position_closed",
        }
    }
}

/// A user-relevant change detected by a scheduler tick.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A pool appeared (or came back) in the cache this tick.
    PoolAnnouncement { pool: PoolRecord },
    /// First active pool ever observed on a chain: one-shot broadcast.
    ProtocolLaunch { chain: Chain },
    /// A tracked position's supply APY moved past the minor threshold.
    ApyChange {
        position: Position,
        pool_name: String,
        underlying_symbol: String,
        pool_utilization: f64,
        old_apy: f64,
        new_apy: f64,
        major: bool,
    },
    /// A tracked position's balance dropped to dust; terminal for that row.
    PositionClosed {
        position: Position,
        pool_name: String,
        underlying_symbol: String,
        pool_utilization: f64,
    },
}

impl ChangeEvent {
    /// Subject key: the identity of the thing the event is about. Paired
    /// with (user, kind) it addresses one cooldown slot in the ledger.
    pub fn subject_key(&self) -> String {
        match self {
            ChangeEvent::PoolAnnouncement { pool } => subject_for_pool(pool.key()),
            ChangeEvent::ProtocolLaunch { chain } => subject_for_chain(*chain),
            ChangeEvent::ApyChange { position, .. } => subject_for_position(position.id),
            ChangeEvent::PositionClosed { position, .. } => subject_for_position(position.id),
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            ChangeEvent::PoolAnnouncement { pool } => pool.chain,
            ChangeEvent::ProtocolLaunch { chain } => *chain,
            ChangeEvent::ApyChange { position, .. } => position.chain,
            ChangeEvent::PositionClosed { position, .. } => position.chain,
        }
    }
}

pub fn subject_for_pool(key: PoolKey) -> String {
    format!("pool:{}", key.canonical())
}

pub fn subject_for_chain(chain: Chain) -> String {
    format!("chain:{}", chain.id())
}

pub fn subject_for_position(position_id: i64) -> String {
    format!("position:{}", position_id)
}

use crate::chains::Chain;
use crate::errors::{store_error, MonitorError, Result};
use crate::events::NotificationKind;
use crate::pools::{PoolKey, PoolRecord};
use crate::utils::{minute_bucket, normalize_wallet_address};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ethers::types::{Address, U256};
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

/// SQLite connection pool type alias.
pub type DbPool = sqlx::SqlitePool;

// ──────────────────────────────────────────────────────────────────────────
// Row types
// ──────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub channel_id: String,
    pub wallet_address: Option<String>,
    pub channel_unreachable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: i64,
    pub user_id: i64,
    pub asset_symbol: String,
    pub min_apy: f64,
    pub risk_label: String,
    pub max_notional: Option<f64>,
    pub signed: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Joined (alert, user) row so the router never does N+1 user lookups.
#[derive(Debug, Clone)]
pub struct ActiveAlert {
    pub alert_id: i64,
    pub user_id: i64,
    pub channel_id: String,
    pub asset_symbol: String,
    pub min_apy: f64,
    pub risk_label: String,
}

#[derive(Debug, Clone)]
pub struct CachedPool {
    pub id: i64,
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
    pub active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl CachedPool {
    pub fn key(&self) -> PoolKey {
        PoolKey {
            address: self.address,
            chain: self.chain,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub pool_address: Address,
    pub chain: Chain,
    pub shares: U256,
    pub underlying_value: U256,
    pub initial_supply_apy: f64,
    pub current_supply_apy: f64,
    pub net_apy: f64,
    pub last_apy_check: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub active: bool,
}

impl Position {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            address: self.pool_address,
            chain: self.chain,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub subject_key: String,
    pub chain_id: Option<i64>,
    pub summary: String,
    pub status: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub user_id: i64,
    pub step: String,
    pub partial_input: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// What a pool-cache upsert did relative to the prior row.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolUpsertOutcome {
    New,
    Reactivated,
    ApyChanged { previous: f64 },
    Unchanged,
}

/// What a position upsert did relative to the prior row. A row that was
/// previously closed counts as `Created` again: its APY baseline resets and
/// no change event may be derived from the stale value.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionUpsertOutcome {
    Created,
    Updated { previous_apy: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────
// Connection & schema
// ──────────────────────────────────────────────────────────────────────────

pub async fn connect(path: &str, max_connections: u32) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
        .map_err(|e| MonitorError::ConfigInvalid(format!("bad database path {}: {}", path, e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // Retries survive a slow filesystem or a lingering WAL lock on restart.
    let max_attempts: u32 = 5;
    let mut last_err: Option<MonitorError> = None;
    for attempt in 1..=max_attempts {
        match SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                info!("✅ Store opened at {} (attempt {}/{})", path, attempt, max_attempts);
                initialize_database(&pool).await?;
                return Ok(pool);
            }
            Err(e) => last_err = Some(store_error(e)),
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200;
        warn!(
            "Store open attempt {}/{} failed, retrying in {} ms...",
            attempt, max_attempts, delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| MonitorError::StoreFatal("unknown connect error".into())))
}

/// Private in-memory store, used by tests and `--once` dry runs.
pub async fn connect_in_memory() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(store_error)?;
    initialize_database(&pool).await?;
    Ok(pool)
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    create_tables(pool).await?;
    Ok(())
}

async fn create_tables(pool: &DbPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id TEXT UNIQUE NOT NULL,
            wallet_address TEXT,
            channel_unreachable INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            asset_symbol TEXT NOT NULL,
            min_apy REAL NOT NULL,
            risk_label TEXT NOT NULL DEFAULT 'Medium',
            max_notional REAL,
            signed INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_user ON alerts(user_id)")
        .execute(pool)
        .await
        .map_err(store_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS pool_cache (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL,
            chain_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            symbol TEXT NOT NULL,
            underlying_symbol TEXT NOT NULL,
            underlying_address TEXT NOT NULL,
            decimals INTEGER NOT NULL,
            tvl TEXT NOT NULL,
            apy REAL NOT NULL,
            borrow_apy REAL NOT NULL DEFAULT 0,
            borrowed TEXT NOT NULL,
            utilization REAL NOT NULL,
            collaterals TEXT NOT NULL DEFAULT '[]',
            active INTEGER NOT NULL DEFAULT 1,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            last_updated_at TEXT NOT NULL,
            UNIQUE(address, chain_id)
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            pool_address TEXT NOT NULL,
            chain_id INTEGER NOT NULL,
            shares TEXT NOT NULL,
            underlying_value TEXT NOT NULL,
            initial_supply_apy REAL NOT NULL,
            current_supply_apy REAL NOT NULL,
            net_apy REAL NOT NULL,
            last_apy_check TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(user_id, pool_address, chain_id)
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS apy_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pool_address TEXT NOT NULL,
            chain_id INTEGER NOT NULL,
            supply_apy REAL NOT NULL,
            borrow_apy REAL NOT NULL,
            tvl TEXT NOT NULL,
            minute_bucket INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_apy_history_pool
         ON apy_history(pool_address, chain_id, recorded_at DESC)",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS notification_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            chain_id INTEGER,
            summary TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'sent',
            sent_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    // Cooldown queries hit this on every event.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notification_cooldown
         ON notification_log(user_id, kind, subject_key, sent_at DESC)",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notification_chain
         ON notification_log(kind, chain_id)",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS conversation_state (
            user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            step TEXT NOT NULL,
            partial_input TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(store_error)?;

    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────
// Users
// ──────────────────────────────────────────────────────────────────────────

/// Creates the user on first contact, returns the existing id otherwise.
pub async fn upsert_user(pool: &DbPool, channel_id: &str) -> Result<i64> {
    sqlx::query(
        "INSERT INTO users (channel_id, created_at) VALUES ($1, $2)
         ON CONFLICT(channel_id) DO NOTHING",
    )
    .bind(channel_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(store_error)?;

    let row = sqlx::query("SELECT id FROM users WHERE channel_id = $1")
        .bind(channel_id)
        .fetch_one(pool)
        .await
        .map_err(store_error)?;
    row.try_get("id").map_err(store_error)
}

pub async fn set_user_wallet(pool: &DbPool, channel_id: &str, wallet: &str) -> Result<()> {
    let canonical = normalize_wallet_address(wallet)
        .ok_or_else(|| MonitorError::ConfigInvalid(format!("invalid wallet address: {}", wallet)))?;
    sqlx::query("UPDATE users SET wallet_address = $1 WHERE channel_id = $2")
        .bind(canonical)
        .bind(channel_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

pub async fn get_users_with_wallets(pool: &DbPool) -> Result<Vec<User>> {
    let rows = sqlx::query(
        "SELECT id, channel_id, wallet_address, channel_unreachable, created_at
         FROM users WHERE wallet_address IS NOT NULL AND wallet_address != ''",
    )
    .fetch_all(pool)
    .await
    .map_err(store_error)?;
    rows.iter().map(user_from_row).collect()
}

pub async fn get_user_by_id(pool: &DbPool, user_id: i64) -> Result<Option<User>> {
    let row = sqlx::query(
        "SELECT id, channel_id, wallet_address, channel_unreachable, created_at
         FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(store_error)?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn get_reachable_users(pool: &DbPool) -> Result<Vec<User>> {
    let rows = sqlx::query(
        "SELECT id, channel_id, wallet_address, channel_unreachable, created_at
         FROM users WHERE channel_unreachable = 0",
    )
    .fetch_all(pool)
    .await
    .map_err(store_error)?;
    rows.iter().map(user_from_row).collect()
}

pub async fn mark_channel_unreachable(pool: &DbPool, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE users SET channel_unreachable = 1 WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

/// Manual reset after a channel becomes deliverable again.
pub async fn reset_channel(pool: &DbPool, channel_id: &str) -> Result<()> {
    sqlx::query("UPDATE users SET channel_unreachable = 0 WHERE channel_id = $1")
        .bind(channel_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

/// Admin utility. Alerts, positions and conversation state cascade.
pub async fn delete_user(pool: &DbPool, channel_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM users WHERE channel_id = $1")
        .bind(channel_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id").map_err(store_error)?,
        channel_id: row.try_get("channel_id").map_err(store_error)?,
        wallet_address: row.try_get("wallet_address").map_err(store_error)?,
        channel_unreachable: row.try_get("channel_unreachable").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
    })
}

// ──────────────────────────────────────────────────────────────────────────
// Alerts
// ──────────────────────────────────────────────────────────────────────────

const ALERT_DEFAULT_TTL_DAYS: i64 = 30;

/// Creates a draft alert. It participates in matching only once signed.
pub async fn create_alert(
    pool: &DbPool,
    user_id: i64,
    asset_symbol: &str,
    min_apy: f64,
    risk_label: &str,
    max_notional: Option<f64>,
) -> Result<i64> {
    if min_apy < 0.0 {
        return Err(MonitorError::ConfigInvalid(format!(
            "negative minimum APY: {}",
            min_apy
        )));
    }
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO alerts (user_id, asset_symbol, min_apy, risk_label, max_notional, signed, active, created_at, expires_at)
         VALUES ($1, $2, $3, $4, $5, 0, 1, $6, $7)",
    )
    .bind(user_id)
    .bind(asset_symbol.to_uppercase())
    .bind(min_apy)
    .bind(risk_label)
    .bind(max_notional)
    .bind(now)
    .bind(now + ChronoDuration::days(ALERT_DEFAULT_TTL_DAYS))
    .execute(pool)
    .await
    .map_err(store_error)?;
    Ok(result.last_insert_rowid())
}

pub async fn sign_alert(pool: &DbPool, alert_id: i64) -> Result<()> {
    sqlx::query("UPDATE alerts SET signed = 1 WHERE id = $1")
        .bind(alert_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

pub async fn set_alert_active(pool: &DbPool, alert_id: i64, active: bool) -> Result<()> {
    sqlx::query("UPDATE alerts SET active = $1 WHERE id = $2")
        .bind(active)
        .bind(alert_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

pub async fn delete_alert(pool: &DbPool, alert_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM alerts WHERE id = $1")
        .bind(alert_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

/// Everything a user has saved, drafts and paused alerts included. Backs the
/// command ingress "list my alerts" surface.
pub async fn get_alerts_for_user(pool: &DbPool, user_id: i64) -> Result<Vec<Alert>> {
    let rows = sqlx::query("SELECT * FROM alerts WHERE user_id = $1 ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(store_error)?;

    rows.iter()
        .map(|row| {
            Ok(Alert {
                id: row.try_get("id").map_err(store_error)?,
                user_id: row.try_get("user_id").map_err(store_error)?,
                asset_symbol: row.try_get("asset_symbol").map_err(store_error)?,
                min_apy: row.try_get("min_apy").map_err(store_error)?,
                risk_label: row.try_get("risk_label").map_err(store_error)?,
                max_notional: row.try_get("max_notional").map_err(store_error)?,
                signed: row.try_get("signed").map_err(store_error)?,
                active: row.try_get("active").map_err(store_error)?,
                created_at: row.try_get("created_at").map_err(store_error)?,
                expires_at: row.try_get("expires_at").map_err(store_error)?,
            })
        })
        .collect()
}

/// Signed, unexpired, unpaused alerts joined with reachable owners.
pub async fn get_active_alerts(pool: &DbPool) -> Result<Vec<ActiveAlert>> {
    let rows = sqlx::query(
        "SELECT a.id AS alert_id, a.user_id, u.channel_id, a.asset_symbol, a.min_apy, a.risk_label
         FROM alerts a
         JOIN users u ON u.id = a.user_id
         WHERE a.signed = 1 AND a.active = 1 AND a.expires_at > $1
           AND u.channel_unreachable = 0",
    )
    .bind(Utc::now())
    .fetch_all(pool)
    .await
    .map_err(store_error)?;

    rows.iter()
        .map(|row| {
            Ok(ActiveAlert {
                alert_id: row.try_get("alert_id").map_err(store_error)?,
                user_id: row.try_get("user_id").map_err(store_error)?,
                channel_id: row.try_get("channel_id").map_err(store_error)?,
                asset_symbol: row.try_get("asset_symbol").map_err(store_error)?,
                min_apy: row.try_get("min_apy").map_err(store_error)?,
                risk_label: row.try_get("risk_label").map_err(store_error)?,
            })
        })
        .collect()
}

// ──────────────────────────────────────────────────────────────────────────
// Pool cache
// ──────────────────────────────────────────────────────────────────────────

/// Upserts one observed pool and classifies the write against the prior row.
/// Single-writer process, so the read-then-write pair needs no transaction.
pub async fn upsert_pool(
    pool: &DbPool,
    record: &PoolRecord,
    now: DateTime<Utc>,
) -> Result<PoolUpsertOutcome> {
    let address_str = format!("{:?}", record.address);
    let chain_id = record.chain.id() as i64;

    let prior = sqlx::query("SELECT apy, active FROM pool_cache WHERE address = $1 AND chain_id = $2")
        .bind(&address_str)
        .bind(chain_id)
        .fetch_optional(pool)
        .await
        .map_err(store_error)?;

    let collaterals =
        serde_json::to_string(&record.collaterals).unwrap_or_else(|_| "[]".to_string());

    sqlx::query(
        "INSERT INTO pool_cache (address, chain_id, name, symbol, underlying_symbol, underlying_address,
                                 decimals, tvl, apy, borrow_apy, borrowed, utilization, collaterals,
                                 active, first_seen_at, last_seen_at, last_updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, $14, $14, $14)
         ON CONFLICT(address, chain_id) DO UPDATE SET
            name = excluded.name,
            symbol = excluded.symbol,
            underlying_symbol = excluded.underlying_symbol,
            underlying_address = excluded.underlying_address,
            decimals = excluded.decimals,
            tvl = excluded.tvl,
            apy = excluded.apy,
            borrow_apy = excluded.borrow_apy,
            borrowed = excluded.borrowed,
            utilization = excluded.utilization,
            collaterals = excluded.collaterals,
            active = 1,
            last_seen_at = excluded.last_seen_at,
            last_updated_at = excluded.last_updated_at",
    )
    .bind(&address_str)
    .bind(chain_id)
    .bind(&record.name)
    .bind(&record.symbol)
    .bind(&record.underlying_symbol)
    .bind(format!("{:?}", record.underlying_address))
    .bind(record.decimals as i64)
    .bind(record.tvl.to_string())
    .bind(record.apy)
    .bind(record.borrow_apy)
    .bind(record.borrowed.to_string())
    .bind(record.utilization)
    .bind(&collaterals)
    .bind(now)
    .execute(pool)
    .await
    .map_err(store_error)?;

    match prior {
        None => Ok(PoolUpsertOutcome::New),
        Some(row) => {
            let was_active: bool = row.try_get("active").map_err(store_error)?;
            let previous: f64 = row.try_get("apy").map_err(store_error)?;
            if !was_active {
                Ok(PoolUpsertOutcome::Reactivated)
            } else if (previous - record.apy).abs() > 1e-9 {
                Ok(PoolUpsertOutcome::ApyChanged { previous })
            } else {
                Ok(PoolUpsertOutcome::Unchanged)
            }
        }
    }
}

/// Deactivates, in one statement, every active row on a scanned chain whose
/// key was not observed this tick. Chains that failed their fetch are not in
/// `scanned_chains`, so their rows are untouched.
pub async fn mark_pools_inactive(
    pool: &DbPool,
    observed: &[PoolKey],
    scanned_chains: &[Chain],
    now: DateTime<Utc>,
) -> Result<u64> {
    if scanned_chains.is_empty() {
        return Ok(0);
    }

    let chain_list = scanned_chains
        .iter()
        .map(|c| c.id().to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let sql = if observed.is_empty() {
        format!(
            "UPDATE pool_cache SET active = 0, last_updated_at = $1
             WHERE active = 1 AND chain_id IN ({})",
            chain_list
        )
    } else {
        let key_list = observed
            .iter()
            .map(|k| format!("'{}'", k.canonical()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE pool_cache SET active = 0, last_updated_at = $1
             WHERE active = 1 AND chain_id IN ({})
               AND address || ':' || chain_id NOT IN ({})",
            chain_list, key_list
        )
    };

    let result = sqlx::query(&sql)
        .bind(now)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(result.rows_affected())
}

pub async fn load_active_pools(pool: &DbPool) -> Result<Vec<CachedPool>> {
    let rows = sqlx::query("SELECT * FROM pool_cache WHERE active = 1 ORDER BY chain_id, id")
        .fetch_all(pool)
        .await
        .map_err(store_error)?;
    rows.iter().map(cached_pool_from_row).collect()
}

pub async fn get_pool(pool: &DbPool, address: Address, chain: Chain) -> Result<Option<CachedPool>> {
    let row = sqlx::query("SELECT * FROM pool_cache WHERE address = $1 AND chain_id = $2")
        .bind(format!("{:?}", address))
        .bind(chain.id() as i64)
        .fetch_optional(pool)
        .await
        .map_err(store_error)?;
    row.as_ref().map(cached_pool_from_row).transpose()
}

fn cached_pool_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CachedPool> {
    let address: String = row.try_get("address").map_err(store_error)?;
    let underlying: String = row.try_get("underlying_address").map_err(store_error)?;
    let chain_id: i64 = row.try_get("chain_id").map_err(store_error)?;
    let tvl: String = row.try_get("tvl").map_err(store_error)?;
    let borrowed: String = row.try_get("borrowed").map_err(store_error)?;
    let collaterals: String = row.try_get("collaterals").map_err(store_error)?;
    let decimals: i64 = row.try_get("decimals").map_err(store_error)?;

    Ok(CachedPool {
        id: row.try_get("id").map_err(store_error)?,
        address: parse_address(&address)?,
        chain: parse_chain(chain_id)?,
        name: row.try_get("name").map_err(store_error)?,
        symbol: row.try_get("symbol").map_err(store_error)?,
        underlying_symbol: row.try_get("underlying_symbol").map_err(store_error)?,
        underlying_address: parse_address(&underlying)?,
        decimals: decimals as u8,
        tvl: parse_u256(&tvl)?,
        apy: row.try_get("apy").map_err(store_error)?,
        borrow_apy: row.try_get("borrow_apy").map_err(store_error)?,
        borrowed: parse_u256(&borrowed)?,
        utilization: row.try_get("utilization").map_err(store_error)?,
        collaterals: serde_json::from_str(&collaterals).unwrap_or_default(),
        active: row.try_get("active").map_err(store_error)?,
        first_seen_at: row.try_get("first_seen_at").map_err(store_error)?,
        last_seen_at: row.try_get("last_seen_at").map_err(store_error)?,
        last_updated_at: row.try_get("last_updated_at").map_err(store_error)?,
    })
}

// ──────────────────────────────────────────────────────────────────────────
// Positions
// ──────────────────────────────────────────────────────────────────────────

/// Upserts one observed position and returns the stored row plus what the
/// write did. Reopening a closed row resets the APY baseline.
pub async fn upsert_position(
    pool: &DbPool,
    user_id: i64,
    key: PoolKey,
    shares: U256,
    underlying_value: U256,
    supply_apy: f64,
    now: DateTime<Utc>,
) -> Result<(Position, PositionUpsertOutcome)> {
    let address_str = format!("{:?}", key.address);
    let chain_id = key.chain.id() as i64;

    let prior = sqlx::query(
        "SELECT current_supply_apy, active FROM positions
         WHERE user_id = $1 AND pool_address = $2 AND chain_id = $3",
    )
    .bind(user_id)
    .bind(&address_str)
    .bind(chain_id)
    .fetch_optional(pool)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "INSERT INTO positions (user_id, pool_address, chain_id, shares, underlying_value,
                                initial_supply_apy, current_supply_apy, net_apy, last_apy_check,
                                created_at, last_updated, active)
         VALUES ($1, $2, $3, $4, $5, $6, $6, $6, $7, $7, $7, 1)
         ON CONFLICT(user_id, pool_address, chain_id) DO UPDATE SET
            shares = excluded.shares,
            underlying_value = excluded.underlying_value,
            current_supply_apy = excluded.current_supply_apy,
            net_apy = excluded.net_apy,
            last_apy_check = excluded.last_apy_check,
            last_updated = excluded.last_updated,
            initial_supply_apy = CASE WHEN positions.active = 0
                THEN excluded.initial_supply_apy ELSE positions.initial_supply_apy END,
            created_at = CASE WHEN positions.active = 0
                THEN excluded.created_at ELSE positions.created_at END,
            active = 1",
    )
    .bind(user_id)
    .bind(&address_str)
    .bind(chain_id)
    .bind(shares.to_string())
    .bind(underlying_value.to_string())
    .bind(supply_apy)
    .bind(now)
    .execute(pool)
    .await
    .map_err(store_error)?;

    let stored = get_position_by_key(pool, user_id, key).await?.ok_or_else(|| {
        MonitorError::StoreFatal("position vanished immediately after upsert".into())
    })?;

    let outcome = match prior {
        None => PositionUpsertOutcome::Created,
        Some(row) => {
            let was_active: bool = row.try_get("active").map_err(store_error)?;
            if !was_active {
                PositionUpsertOutcome::Created
            } else {
                PositionUpsertOutcome::Updated {
                    previous_apy: row.try_get("current_supply_apy").map_err(store_error)?,
                }
            }
        }
    };
    Ok((stored, outcome))
}

pub async fn close_position(pool: &DbPool, position_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE positions SET active = 0, last_updated = $1 WHERE id = $2")
        .bind(now)
        .bind(position_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

pub async fn load_active_positions(pool: &DbPool) -> Result<Vec<Position>> {
    let rows = sqlx::query("SELECT * FROM positions WHERE active = 1 ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(store_error)?;
    rows.iter().map(position_from_row).collect()
}

pub async fn load_active_positions_for_user(pool: &DbPool, user_id: i64) -> Result<Vec<Position>> {
    let rows = sqlx::query("SELECT * FROM positions WHERE active = 1 AND user_id = $1 ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(store_error)?;
    rows.iter().map(position_from_row).collect()
}

pub async fn get_position_by_key(
    pool: &DbPool,
    user_id: i64,
    key: PoolKey,
) -> Result<Option<Position>> {
    let row = sqlx::query(
        "SELECT * FROM positions WHERE user_id = $1 AND pool_address = $2 AND chain_id = $3",
    )
    .bind(user_id)
    .bind(format!("{:?}", key.address))
    .bind(key.chain.id() as i64)
    .fetch_optional(pool)
    .await
    .map_err(store_error)?;
    row.as_ref().map(position_from_row).transpose()
}

fn position_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
    let address: String = row.try_get("pool_address").map_err(store_error)?;
    let chain_id: i64 = row.try_get("chain_id").map_err(store_error)?;
    let shares: String = row.try_get("shares").map_err(store_error)?;
    let value: String = row.try_get("underlying_value").map_err(store_error)?;

    Ok(Position {
        id: row.try_get("id").map_err(store_error)?,
        user_id: row.try_get("user_id").map_err(store_error)?,
        pool_address: parse_address(&address)?,
        chain: parse_chain(chain_id)?,
        shares: parse_u256(&shares)?,
        underlying_value: parse_u256(&value)?,
        initial_supply_apy: row.try_get("initial_supply_apy").map_err(store_error)?,
        current_supply_apy: row.try_get("current_supply_apy").map_err(store_error)?,
        net_apy: row.try_get("net_apy").map_err(store_error)?,
        last_apy_check: row.try_get("last_apy_check").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
        last_updated: row.try_get("last_updated").map_err(store_error)?,
        active: row.try_get("active").map_err(store_error)?,
    })
}

// ──────────────────────────────────────────────────────────────────────────
// APY history
// ──────────────────────────────────────────────────────────────────────────

/// Appends one sample unless the same pool already has one in this minute
/// bucket. Returns whether a row was written.
pub async fn insert_apy_sample(
    pool: &DbPool,
    key: PoolKey,
    supply_apy: f64,
    borrow_apy: f64,
    tvl: U256,
    at: DateTime<Utc>,
) -> Result<bool> {
    let bucket = minute_bucket(at);
    let result = sqlx::query(
        "INSERT INTO apy_history (pool_address, chain_id, supply_apy, borrow_apy, tvl, minute_bucket, recorded_at)
         SELECT $1, $2, $3, $4, $5, $6, $7
         WHERE NOT EXISTS (
            SELECT 1 FROM apy_history
            WHERE pool_address = $1 AND chain_id = $2 AND minute_bucket = $6
         )",
    )
    .bind(format!("{:?}", key.address))
    .bind(key.chain.id() as i64)
    .bind(supply_apy)
    .bind(borrow_apy)
    .bind(tvl.to_string())
    .bind(bucket)
    .bind(at)
    .execute(pool)
    .await
    .map_err(store_error)?;
    Ok(result.rows_affected() > 0)
}

/// Trend query: most recent samples first.
pub async fn load_recent_apy_samples(
    pool: &DbPool,
    key: PoolKey,
    limit: i64,
) -> Result<Vec<(f64, f64, DateTime<Utc>)>> {
    let rows = sqlx::query(
        "SELECT supply_apy, borrow_apy, recorded_at FROM apy_history
         WHERE pool_address = $1 AND chain_id = $2
         ORDER BY recorded_at DESC LIMIT $3",
    )
    .bind(format!("{:?}", key.address))
    .bind(key.chain.id() as i64)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(store_error)?;

    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("supply_apy").map_err(store_error)?,
                row.try_get("borrow_apy").map_err(store_error)?,
                row.try_get("recorded_at").map_err(store_error)?,
            ))
        })
        .collect()
}

pub async fn prune_apy_samples(pool: &DbPool, older_than_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - ChronoDuration::days(older_than_days as i64);
    let result = sqlx::query("DELETE FROM apy_history WHERE recorded_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(result.rows_affected())
}

// ──────────────────────────────────────────────────────────────────────────
// Notification ledger
// ──────────────────────────────────────────────────────────────────────────

pub async fn record_notification(
    pool: &DbPool,
    user_id: i64,
    kind: NotificationKind,
    subject_key: &str,
    chain: Option<Chain>,
    summary: &str,
    status: DeliveryStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO notification_log (user_id, kind, subject_key, chain_id, summary, status, sent_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(user_id)
    .bind(kind.as_str())
    .bind(subject_key)
    .bind(chain.map(|c| c.id() as i64))
    .bind(summary)
    .bind(status.as_str())
    .bind(at)
    .execute(pool)
    .await
    .map_err(store_error)?;
    Ok(())
}

/// Cooldown probe. `window = None` means "ever" (permanent cooldown).
/// Only successful deliveries count; failed attempts never suppress a retry
/// after the next qualifying event.
pub async fn was_notified_within(
    pool: &DbPool,
    user_id: i64,
    kind: NotificationKind,
    subject_key: &str,
    window: Option<ChronoDuration>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let count: i64 = match window {
        Some(window) => {
            let cutoff = now - window;
            sqlx::query(
                "SELECT COUNT(*) AS count FROM notification_log
                 WHERE user_id = $1 AND kind = $2 AND subject_key = $3
                   AND status = 'sent' AND sent_at > $4",
            )
            .bind(user_id)
            .bind(kind.as_str())
            .bind(subject_key)
            .bind(cutoff)
            .fetch_one(pool)
            .await
            .map_err(store_error)?
            .try_get("count")
            .map_err(store_error)?
        }
        None => sqlx::query(
            "SELECT COUNT(*) AS count FROM notification_log
             WHERE user_id = $1 AND kind = $2 AND subject_key = $3 AND status = 'sent'",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(subject_key)
        .fetch_one(pool)
        .await
        .map_err(store_error)?
        .try_get("count")
        .map_err(store_error)?,
    };
    Ok(count > 0)
}

/// Whether any pool announcement was ever delivered for a chain. Drives the
/// one-shot protocol-launch broadcast.
pub async fn has_any_announcement_for_chain(pool: &DbPool, chain: Chain) -> Result<bool> {
    let count: i64 = sqlx::query(
        "SELECT COUNT(*) AS count FROM notification_log
         WHERE kind = $1 AND chain_id = $2 AND status = 'sent'",
    )
    .bind(NotificationKind::PoolAnnouncement.as_str())
    .bind(chain.id() as i64)
    .fetch_one(pool)
    .await
    .map_err(store_error)?
    .try_get("count")
    .map_err(store_error)?;
    Ok(count > 0)
}

pub async fn load_notifications_for_user(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<NotificationRecord>> {
    let rows = sqlx::query("SELECT * FROM notification_log WHERE user_id = $1 ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(store_error)?;

    rows.iter()
        .map(|row| {
            Ok(NotificationRecord {
                id: row.try_get("id").map_err(store_error)?,
                user_id: row.try_get("user_id").map_err(store_error)?,
                kind: row.try_get("kind").map_err(store_error)?,
                subject_key: row.try_get("subject_key").map_err(store_error)?,
                chain_id: row.try_get("chain_id").map_err(store_error)?,
                summary: row.try_get("summary").map_err(store_error)?,
                status: row.try_get("status").map_err(store_error)?,
                sent_at: row.try_get("sent_at").map_err(store_error)?,
            })
        })
        .collect()
}

// ──────────────────────────────────────────────────────────────────────────
// Conversation state
// ──────────────────────────────────────────────────────────────────────────

pub async fn put_conversation_state(
    pool: &DbPool,
    user_id: i64,
    step: &str,
    partial_input: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO conversation_state (user_id, step, partial_input, updated_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT(user_id) DO UPDATE SET
            step = excluded.step,
            partial_input = excluded.partial_input,
            updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(step)
    .bind(partial_input.to_string())
    .bind(now)
    .execute(pool)
    .await
    .map_err(store_error)?;
    Ok(())
}

/// Returns the user's conversation state unless it has outlived `ttl`.
pub async fn get_conversation_state(
    pool: &DbPool,
    user_id: i64,
    ttl: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<Option<ConversationRow>> {
    let row = sqlx::query("SELECT * FROM conversation_state WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(store_error)?;

    let Some(row) = row else { return Ok(None) };
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(store_error)?;
    if now - updated_at > ttl {
        return Ok(None);
    }
    let partial: String = row.try_get("partial_input").map_err(store_error)?;
    Ok(Some(ConversationRow {
        user_id: row.try_get("user_id").map_err(store_error)?,
        step: row.try_get("step").map_err(store_error)?,
        partial_input: serde_json::from_str(&partial).unwrap_or(serde_json::Value::Null),
        updated_at,
    }))
}

pub async fn clear_conversation_state(pool: &DbPool, user_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM conversation_state WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

pub async fn clear_expired_conversations(
    pool: &DbPool,
    ttl: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<u64> {
    let cutoff = now - ttl;
    let result = sqlx::query("DELETE FROM conversation_state WHERE updated_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(result.rows_affected())
}

// ──────────────────────────────────────────────────────────────────────────
// Parse helpers
// ──────────────────────────────────────────────────────────────────────────

fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw)
        .map_err(|e| MonitorError::StoreFatal(format!("corrupt address column {}: {}", raw, e)))
}

fn parse_chain(id: i64) -> Result<Chain> {
    Chain::from_id(id as u64)
        .ok_or_else(|| MonitorError::StoreFatal(format!("unknown chain id in store: {}", id)))
}

fn parse_u256(raw: &str) -> Result<U256> {
    U256::from_dec_str(raw)
        .map_err(|e| MonitorError::StoreFatal(format!("corrupt amount column {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::Chain;

    fn sample_record(chain: Chain, apy: f64) -> PoolRecord {
        PoolRecord {
            address: "0x00000000000000000000000000000000000000a1".parse().unwrap(),
            chain,
            name: "USDC Lending Pool".into(),
            symbol: "dUSDC".into(),
            underlying_symbol: "USDC".into(),
            underlying_address: "0x00000000000000000000000000000000000000b2".parse().unwrap(),
            decimals: 6,
            tvl: U256::from(1_000_000u64),
            apy,
            borrow_apy: apy * 1.4,
            borrowed: U256::from(400_000u64),
            utilization: 40.0,
            collaterals: vec!["WETH".into()],
        }
    }

    #[tokio::test]
    async fn pool_upsert_classifies_transitions() {
        let db = connect_in_memory().await.unwrap();
        let now = Utc::now();

        let first = upsert_pool(&db, &sample_record(Chain::Ethereum, 6.0), now).await.unwrap();
        assert_eq!(first, PoolUpsertOutcome::New);

        let second = upsert_pool(&db, &sample_record(Chain::Ethereum, 6.0), now).await.unwrap();
        assert_eq!(second, PoolUpsertOutcome::Unchanged);

        let third = upsert_pool(&db, &sample_record(Chain::Ethereum, 5.3), now).await.unwrap();
        assert_eq!(third, PoolUpsertOutcome::ApyChanged { previous: 6.0 });

        mark_pools_inactive(&db, &[], &[Chain::Ethereum], now).await.unwrap();
        let fourth = upsert_pool(&db, &sample_record(Chain::Ethereum, 5.3), now).await.unwrap();
        assert_eq!(fourth, PoolUpsertOutcome::Reactivated);
    }

    #[tokio::test]
    async fn mark_inactive_scopes_to_scanned_chains() {
        let db = connect_in_memory().await.unwrap();
        let now = Utc::now();
        upsert_pool(&db, &sample_record(Chain::Ethereum, 6.0), now).await.unwrap();
        upsert_pool(&db, &sample_record(Chain::Arbitrum, 7.0), now).await.unwrap();

        // Arbitrum scanned and empty; Ethereum not scanned at all.
        let flipped = mark_pools_inactive(&db, &[], &[Chain::Arbitrum], now).await.unwrap();
        assert_eq!(flipped, 1);

        let active = load_active_pools(&db).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].chain, Chain::Ethereum);
    }

    #[tokio::test]
    async fn reopened_position_resets_baseline() {
        let db = connect_in_memory().await.unwrap();
        let now = Utc::now();
        let user = upsert_user(&db, "chat-1").await.unwrap();
        let key = PoolKey {
            address: "0x00000000000000000000000000000000000000a1".parse().unwrap(),
            chain: Chain::Optimism,
        };

        let (_, created) =
            upsert_position(&db, user, key, U256::from(10u64), U256::from(10u64), 6.0, now)
                .await
                .unwrap();
        assert_eq!(created, PositionUpsertOutcome::Created);

        let (p, updated) =
            upsert_position(&db, user, key, U256::from(10u64), U256::from(10u64), 5.0, now)
                .await
                .unwrap();
        assert_eq!(updated, PositionUpsertOutcome::Updated { previous_apy: 6.0 });

        close_position(&db, p.id, now).await.unwrap();
        let (p, reopened) =
            upsert_position(&db, user, key, U256::from(4u64), U256::from(4u64), 9.0, now)
                .await
                .unwrap();
        assert_eq!(reopened, PositionUpsertOutcome::Created);
        assert_eq!(p.initial_supply_apy, 9.0);
        assert!(p.active);
    }

    #[tokio::test]
    async fn cooldown_counts_only_successful_sends() {
        let db = connect_in_memory().await.unwrap();
        let now = Utc::now();
        let user = upsert_user(&db, "chat-2").await.unwrap();

        record_notification(
            &db,
            user,
            NotificationKind::AlertMatch,
            "pool:0xa:1",
            Some(Chain::Ethereum),
            "failed once",
            DeliveryStatus::Failed,
            now,
        )
        .await
        .unwrap();

        let hit = was_notified_within(
            &db,
            user,
            NotificationKind::AlertMatch,
            "pool:0xa:1",
            Some(ChronoDuration::hours(24)),
            now,
        )
        .await
        .unwrap();
        assert!(!hit);

        record_notification(
            &db,
            user,
            NotificationKind::AlertMatch,
            "pool:0xa:1",
            Some(Chain::Ethereum),
            "delivered",
            DeliveryStatus::Sent,
            now,
        )
        .await
        .unwrap();

        let hit = was_notified_within(
            &db,
            user,
            NotificationKind::AlertMatch,
            "pool:0xa:1",
            Some(ChronoDuration::hours(24)),
            now,
        )
        .await
        .unwrap();
        assert!(hit);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let path_str = path.to_str().unwrap();
        {
            let db = connect(path_str, 2).await.unwrap();
            upsert_user(&db, "chat-file").await.unwrap();
            db.close().await;
        }
        let db = connect(path_str, 2).await.unwrap();
        let id = upsert_user(&db, "chat-file").await.unwrap();
        let users = get_reachable_users(&db).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, id);
    }

    #[tokio::test]
    async fn apy_samples_dedup_by_minute() {
        let db = connect_in_memory().await.unwrap();
        let key = PoolKey {
            address: "0x00000000000000000000000000000000000000a1".parse().unwrap(),
            chain: Chain::Sonic,
        };
        let now = Utc::now();
        assert!(insert_apy_sample(&db, key, 6.0, 8.0, U256::from(1u64), now).await.unwrap());
        assert!(!insert_apy_sample(&db, key, 6.1, 8.1, U256::from(1u64), now).await.unwrap());
        let samples = load_recent_apy_samples(&db, key, 10).await.unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn alert_lifecycle_is_visible_to_its_owner() {
        let db = connect_in_memory().await.unwrap();
        let user = upsert_user(&db, "chat-al").await.unwrap();
        let id = create_alert(&db, user, "usdc", 5.0, "Low", Some(10_000.0)).await.unwrap();

        // draft: uppercased asset, 30-day expiry, not yet matching
        let alerts = get_alerts_for_user(&db, user).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].asset_symbol, "USDC");
        assert!(!alerts[0].signed);
        assert!(alerts[0].expires_at > alerts[0].created_at);
        assert!(get_active_alerts(&db).await.unwrap().is_empty());

        sign_alert(&db, id).await.unwrap();
        assert_eq!(get_active_alerts(&db).await.unwrap().len(), 1);

        set_alert_active(&db, id, false).await.unwrap();
        assert!(get_active_alerts(&db).await.unwrap().is_empty());

        delete_alert(&db, id).await.unwrap();
        assert!(get_alerts_for_user(&db, user).await.unwrap().is_empty());

        assert!(create_alert(&db, user, "USDC", -1.0, "Low", None).await.is_err());
    }

    #[tokio::test]
    async fn conversation_state_expires_by_ttl() {
        let db = connect_in_memory().await.unwrap();
        let user = upsert_user(&db, "chat-conv").await.unwrap();
        let now = Utc::now();
        let partial = serde_json::json!({"asset": "USDC"});

        put_conversation_state(&db, user, "awaiting_min_apy", &partial, now).await.unwrap();

        let ttl = ChronoDuration::minutes(30);
        let fresh = get_conversation_state(&db, user, ttl, now).await.unwrap();
        assert_eq!(fresh.unwrap().step, "awaiting_min_apy");

        let later = now + ChronoDuration::minutes(31);
        assert!(get_conversation_state(&db, user, ttl, later).await.unwrap().is_none());

        let cleared = clear_expired_conversations(&db, ttl, later).await.unwrap();
        assert_eq!(cleared, 1);
    }

    #[tokio::test]
    async fn cascade_delete_removes_owned_rows() {
        let db = connect_in_memory().await.unwrap();
        let now = Utc::now();
        let user = upsert_user(&db, "chat-3").await.unwrap();
        create_alert(&db, user, "usdc", 5.0, "Low", None).await.unwrap();
        let key = PoolKey {
            address: "0x00000000000000000000000000000000000000a1".parse().unwrap(),
            chain: Chain::Ethereum,
        };
        upsert_position(&db, user, key, U256::one(), U256::one(), 5.0, now).await.unwrap();

        delete_user(&db, "chat-3").await.unwrap();
        assert!(load_active_positions(&db).await.unwrap().is_empty());
        assert!(get_active_alerts(&db).await.unwrap().is_empty());
    }
}

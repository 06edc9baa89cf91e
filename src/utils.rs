// src/utils.rs
// Formatting and validation helpers shared across the monitor.

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};

/// Formats a percentage with two decimal places, e.g. `6.20%`.
pub fn format_percent(value: f64) -> String {
    format!("{:.2}%", value)
}

/// Formats an on-chain amount in display units with K/M suffixes.
/// `1_250_000 USDC` (6 decimals) renders as `1.25M`.
pub fn format_underlying_amount(amount: U256, decimals: u8) -> String {
    let scaled = u256_to_f64_lossy(amount) / 10f64.powi(decimals as i32);
    if scaled >= 1_000_000.0 {
        format!("{:.2}M", scaled / 1_000_000.0)
    } else if scaled >= 1_000.0 {
        format!("{:.2}K", scaled / 1_000.0)
    } else {
        format!("{:.2}", scaled)
    }
}

/// Lossy conversion for display purposes only. Precise amounts stay `U256`
/// end to end; this is called exactly once, at the formatting boundary.
pub fn u256_to_f64_lossy(value: U256) -> f64 {
    let mut result = 0f64;
    for i in (0..4).rev() {
        result = result * 18_446_744_073_709_551_616.0 + value.0[i] as f64;
    }
    result
}

/// Shortened `0x1234..abcd` form for log lines and fallback symbols.
pub fn truncate_address(address: Address) -> String {
    let full = format!("{:?}", address);
    format!("{}..{}", &full[..6], &full[full.len() - 4..])
}

/// Validates and canonicalizes a wallet address: `0x` + 40 hex chars,
/// lower-cased. Returns the canonical form.
pub fn normalize_wallet_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X"))?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex_part.to_ascii_lowercase()))
}

/// Minute bucket used to deduplicate APY samples within a tick.
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp() / 60
}

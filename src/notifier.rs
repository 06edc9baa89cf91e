// src/notifier.rs
// Notification router: converts change events into per-user deliveries.
//
// Per (user, kind, subject):
//   cooldown check -> match/format -> deliver (retry transient) -> ledger.
// The ledger write happens strictly after a successful delivery, so a crash
// in between re-delivers rather than silently drops.

use crate::chains::Chain;
use crate::database::{self, DbPool, DeliveryStatus, Position};
use crate::errors::{MonitorError, Result};
use crate::events::{ChangeEvent, NotificationKind};
use crate::metrics;
use crate::pools::{PoolHealth, PoolRecord};
use crate::settings::Settings;
use crate::telegram::{ActionTarget, ChatGateway, MessageAction};
use crate::utils::{format_percent, format_underlying_amount};
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub struct NotificationRouter {
    db: DbPool,
    gateway: Arc<dyn ChatGateway>,
    settings: Arc<Settings>,
}

impl NotificationRouter {
    pub fn new(db: DbPool, gateway: Arc<dyn ChatGateway>, settings: Arc<Settings>) -> Self {
        Self {
            db,
            gateway,
            settings,
        }
    }

    /// Routes one event. Events for one user are handed in observation order
    /// by the schedulers; this method is not called concurrently.
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::PoolAnnouncement { pool } => self.handle_pool_announcement(pool).await,
            ChangeEvent::ProtocolLaunch { chain } => self.handle_protocol_launch(*chain).await,
            ChangeEvent::ApyChange {
                position,
                pool_name,
                underlying_symbol,
                pool_utilization,
                old_apy,
                new_apy,
                major,
            } => {
                self.handle_apy_change(
                    position,
                    pool_name,
                    underlying_symbol,
                    *pool_utilization,
                    *old_apy,
                    *new_apy,
                    *major,
                )
                .await
            }
            ChangeEvent::PositionClosed {
                position,
                pool_name,
                underlying_symbol,
                pool_utilization,
            } => {
                self.handle_position_closed(position, pool_name, underlying_symbol, *pool_utilization)
                    .await
            }
        }
    }

    /// New pool vs. every active signed alert: the alert's asset must equal
    /// the pool's underlying (or be ALL) and the pool APY must clear the
    /// alert's minimum. 24h cooldown per (user, pool, chain).
    async fn handle_pool_announcement(&self, pool: &PoolRecord) -> Result<()> {
        let subject = crate::events::subject_for_pool(pool.key());
        let alerts = database::get_active_alerts(&self.db).await?;
        let pool_asset = pool.underlying_symbol.to_uppercase();

        for alert in alerts {
            let asset_matches = alert.asset_symbol == "ALL" || alert.asset_symbol == pool_asset;
            if !asset_matches || pool.apy < alert.min_apy {
                continue;
            }

            let window = ChronoDuration::hours(self.settings.notifier.alert_match_cooldown_hours as i64);
            if database::was_notified_within(
                &self.db,
                alert.user_id,
                NotificationKind::AlertMatch,
                &subject,
                Some(window),
                Utc::now(),
            )
            .await?
            {
                continue;
            }

            let (text, actions) = self.format_alert_match(pool);
            let summary = format!(
                "{} on {} at {}",
                pool.underlying_symbol,
                pool.chain.name(),
                format_percent(pool.apy)
            );
            self.dispatch(
                alert.user_id,
                &alert.channel_id,
                NotificationKind::AlertMatch,
                &subject,
                Some(pool.chain),
                &summary,
                &text,
                &actions,
            )
            .await?;
        }
        Ok(())
    }

    /// One-shot broadcast: once per (user, chain), ever.
    async fn handle_protocol_launch(&self, chain: Chain) -> Result<()> {
        let subject = crate::events::subject_for_chain(chain);
        let users = database::get_reachable_users(&self.db).await?;
        info!("📣 protocol launch on {} -> {} users", chain, users.len());

        for user in users {
            if database::was_notified_within(
                &self.db,
                user.id,
                NotificationKind::PoolAnnouncement,
                &subject,
                None,
                Utc::now(),
            )
            .await?
            {
                continue;
            }

            let (text, actions) = self.format_protocol_launch(chain);
            let summary = format!("protocol launch on {}", chain.name());
            self.dispatch(
                user.id,
                &user.channel_id,
                NotificationKind::PoolAnnouncement,
                &subject,
                Some(chain),
                &summary,
                &text,
                &actions,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_apy_change(
        &self,
        position: &Position,
        pool_name: &str,
        underlying_symbol: &str,
        pool_utilization: f64,
        old_apy: f64,
        new_apy: f64,
        major: bool,
    ) -> Result<()> {
        let Some(user) = database::get_user_by_id(&self.db, position.user_id).await? else {
            return Ok(());
        };
        if user.channel_unreachable {
            return Ok(());
        }

        let subject = crate::events::subject_for_position(position.id);
        let window = ChronoDuration::hours(self.settings.notifier.apy_change_cooldown_hours as i64);
        if database::was_notified_within(
            &self.db,
            user.id,
            NotificationKind::ApyChange,
            &subject,
            Some(window),
            Utc::now(),
        )
        .await?
        {
            return Ok(());
        }

        let (text, actions) = self.format_apy_change(
            position,
            pool_name,
            underlying_symbol,
            pool_utilization,
            old_apy,
            new_apy,
            major,
        );
        let summary = format!(
            "APY {} -> {} on {}",
            format_percent(old_apy),
            format_percent(new_apy),
            pool_name
        );
        self.dispatch(
            user.id,
            &user.channel_id,
            NotificationKind::ApyChange,
            &subject,
            Some(position.chain),
            &summary,
            &text,
            &actions,
        )
        .await
    }

    /// No cooldown: the position is already inactive, so the event fires at
    /// most once by construction.
    async fn handle_position_closed(
        &self,
        position: &Position,
        pool_name: &str,
        underlying_symbol: &str,
        pool_utilization: f64,
    ) -> Result<()> {
        let Some(user) = database::get_user_by_id(&self.db, position.user_id).await? else {
            return Ok(());
        };
        if user.channel_unreachable {
            return Ok(());
        }

        let subject = crate::events::subject_for_position(position.id);
        let (text, actions) =
            self.format_position_closed(position, pool_name, underlying_symbol, pool_utilization);
        let summary = format!("position closed on {}", pool_name);
        self.dispatch(
            user.id,
            &user.channel_id,
            NotificationKind::PositionClosed,
            &subject,
            Some(position.chain),
            &summary,
            &text,
            &actions,
        )
        .await
    }

    /// Delivery pipeline shared by all kinds: retry transient failures with
    /// exponential backoff, write the ledger after success, record failures
    /// instead of dropping them, quarantine dead channels.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        user_id: i64,
        channel_id: &str,
        kind: NotificationKind,
        subject: &str,
        chain: Option<Chain>,
        summary: &str,
        text: &str,
        actions: &[MessageAction],
    ) -> Result<()> {
        let max_retries = self.settings.notifier.delivery_max_retries;
        let base_delay = self.settings.notifier.delivery_base_delay_ms;
        let mut attempt: u32 = 0;

        let failure = loop {
            match self.gateway.send(channel_id, text, actions).await {
                Ok(()) => {
                    database::record_notification(
                        &self.db,
                        user_id,
                        kind,
                        subject,
                        chain,
                        summary,
                        DeliveryStatus::Sent,
                        Utc::now(),
                    )
                    .await?;
                    metrics::increment_delivery(kind.as_str(), "sent");
                    info!("📨 {} -> user {} ({})", kind.as_str(), user_id, summary);
                    return Ok(());
                }
                Err(e @ MonitorError::DeliverTransient(_)) if attempt < max_retries => {
                    let delay = Duration::from_millis(base_delay.saturating_mul(1 << attempt));
                    warn!(
                        "⚠️ delivery to user {} failed (attempt {}/{}), retrying in {:?}: {}",
                        user_id,
                        attempt + 1,
                        max_retries,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        // The cooldown ledger only counts successful sends, so a recorded
        // failure never suppresses the next qualifying event.
        database::record_notification(
            &self.db,
            user_id,
            kind,
            subject,
            chain,
            &format!("{} [delivery failed: {}]", summary, failure),
            DeliveryStatus::Failed,
            Utc::now(),
        )
        .await?;
        metrics::increment_delivery(kind.as_str(), "failed");

        if let MonitorError::DeliverPermanent(_) = failure {
            warn!("🚫 channel of user {} unreachable, quarantining: {}", user_id, failure);
            database::mark_channel_unreachable(&self.db, user_id).await?;
        }
        Ok(())
    }

    // ──────────────────────────────────────────────────────────────────────
    // Formatting. Contract per message: kind headline, pool/position name +
    // chain, asset symbol, the triggering numeric, a utilization health
    // qualifier, and a deep-link action.
    // ──────────────────────────────────────────────────────────────────────

    pub fn format_alert_match(&self, pool: &PoolRecord) -> (String, Vec<MessageAction>) {
        let health = pool.health();
        let text = format!(
            "🎯 *New pool matches your alert*\n\n\
             *{}* on {}\n\
             Asset: {}\n\
             Supply APY: {}\n\
             TVL: {} {}\n\
             Pool health: {} (utilization {})",
            pool.name,
            pool.chain.name(),
            pool.underlying_symbol,
            format_percent(pool.apy),
            format_underlying_amount(pool.tvl, pool.decimals),
            pool.underlying_symbol,
            health.label(),
            format_percent(pool.utilization),
        );
        let actions = vec![MessageAction {
            label: "View pool".into(),
            target: ActionTarget::Url(self.pool_link(pool.chain, &format!("{:?}", pool.address))),
        }];
        (text, actions)
    }

    pub fn format_protocol_launch(&self, chain: Chain) -> (String, Vec<MessageAction>) {
        let text = format!(
            "🚀 *Lending pools are live on {}*\n\n\
             The protocol has launched its first pool on {} (chain id {}). \
             New markets on this chain will show up in your alerts from now on.",
            chain.name(),
            chain.name(),
            chain.id(),
        );
        let actions = vec![MessageAction {
            label: "Browse pools".into(),
            target: ActionTarget::Url(format!(
                "{}/chains/{}",
                self.settings.notifier.deep_link_base,
                chain.id()
            )),
        }];
        (text, actions)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn format_apy_change(
        &self,
        position: &Position,
        pool_name: &str,
        underlying_symbol: &str,
        pool_utilization: f64,
        old_apy: f64,
        new_apy: f64,
        major: bool,
    ) -> (String, Vec<MessageAction>) {
        let delta = new_apy - old_apy;
        let headline = match (major, delta < 0.0) {
            (true, true) => "🚨 *Major APY drop on your position*",
            (true, false) => "🚨 *Major APY jump on your position*",
            (false, true) => "📉 *APY dip on your position*",
            (false, false) => "📈 *APY rise on your position*",
        };
        let health = PoolHealth::from_utilization(pool_utilization);
        let text = format!(
            "{}\n\n\
             *{}* on {}\n\
             Asset: {}\n\
             Supply APY: {} → {} (Δ {})\n\
             Pool health: {} (utilization {})",
            headline,
            pool_name,
            position.chain.name(),
            underlying_symbol,
            format_percent(old_apy),
            format_percent(new_apy),
            format_percent(delta),
            health.label(),
            format_percent(pool_utilization),
        );
        let actions = vec![MessageAction {
            label: "View position".into(),
            target: ActionTarget::Url(
                self.position_link(position.chain, &format!("{:?}", position.pool_address)),
            ),
        }];
        (text, actions)
    }

    pub fn format_position_closed(
        &self,
        position: &Position,
        pool_name: &str,
        underlying_symbol: &str,
        pool_utilization: f64,
    ) -> (String, Vec<MessageAction>) {
        let health = PoolHealth::from_utilization(pool_utilization);
        let text = format!(
            "✅ *Position closed*\n\n\
             *{}* on {}\n\
             Asset: {}\n\
             Your share balance dropped to zero; tracking for this position has stopped.\n\
             Entry APY was {}, last seen {}.\n\
             Pool health: {} (utilization {})",
            pool_name,
            position.chain.name(),
            underlying_symbol,
            format_percent(position.initial_supply_apy),
            format_percent(position.current_supply_apy),
            health.label(),
            format_percent(pool_utilization),
        );
        let actions = vec![MessageAction {
            label: "Open dashboard".into(),
            target: ActionTarget::Url(self.settings.notifier.deep_link_base.clone()),
        }];
        (text, actions)
    }

    fn pool_link(&self, chain: Chain, address: &str) -> String {
        format!(
            "{}/pools/{}/{}",
            self.settings.notifier.deep_link_base,
            chain.id(),
            address
        )
    }

    fn position_link(&self, chain: Chain, address: &str) -> String {
        format!(
            "{}/positions/{}/{}",
            self.settings.notifier.deep_link_base,
            chain.id(),
            address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::Chain;
    use ethers::types::U256;

    fn router() -> NotificationRouter {
        // Formatting tests never touch the store or the gateway.
        struct NoGateway;
        #[async_trait::async_trait]
        impl ChatGateway for NoGateway {
            async fn send(&self, _: &str, _: &str, _: &[MessageAction]) -> Result<()> {
                Ok(())
            }
        }
        let db = DbPool::connect_lazy("sqlite::memory:").expect("lazy pool");
        NotificationRouter::new(db, Arc::new(NoGateway), Arc::new(Settings::default()))
    }

    fn sample_pool() -> PoolRecord {
        PoolRecord {
            address: "0x00000000000000000000000000000000000000aa".parse().unwrap(),
            chain: Chain::Ethereum,
            name: "USDC Lending Pool".into(),
            symbol: "dUSDC".into(),
            underlying_symbol: "USDC".into(),
            underlying_address: "0x00000000000000000000000000000000000000bb".parse().unwrap(),
            decimals: 6,
            tvl: U256::from(1_250_000u64) * U256::exp10(6),
            apy: 6.2,
            borrow_apy: 8.4,
            borrowed: U256::from(500_000u64) * U256::exp10(6),
            utilization: 40.0,
            collaterals: vec![],
        }
    }

    #[tokio::test]
    async fn alert_match_message_carries_the_contract_fields() {
        let router = router();
        let (text, actions) = router.format_alert_match(&sample_pool());
        assert!(text.contains("USDC"));
        assert!(text.contains("6.20%"));
        assert!(text.contains("Ethereum"));
        assert!(text.contains("1.25M"));
        assert!(text.contains("healthy"));
        assert_eq!(actions.len(), 1);
        match &actions[0].target {
            ActionTarget::Url(url) => assert!(url.contains("/pools/1/0x")),
            ActionTarget::Callback(_) => panic!("expected a deep link"),
        }
    }

    #[tokio::test]
    async fn apy_change_message_distinguishes_major() {
        let router = router();
        let position = Position {
            id: 7,
            user_id: 1,
            pool_address: "0x00000000000000000000000000000000000000aa".parse().unwrap(),
            chain: Chain::Arbitrum,
            shares: U256::from(10u64),
            underlying_value: U256::from(10u64),
            initial_supply_apy: 6.0,
            current_supply_apy: 3.5,
            net_apy: 3.5,
            last_apy_check: Utc::now(),
            created_at: Utc::now(),
            last_updated: Utc::now(),
            active: true,
        };
        let (minor, _) =
            router.format_apy_change(&position, "USDC Pool", "USDC", 50.0, 6.0, 5.3, false);
        assert!(minor.contains("📉"));
        assert!(minor.contains("6.00%"));
        assert!(minor.contains("5.30%"));

        let (major, _) =
            router.format_apy_change(&position, "USDC Pool", "USDC", 96.0, 6.0, 3.5, true);
        assert!(major.contains("🚨"));
        assert!(major.contains("constrained"));
    }
}

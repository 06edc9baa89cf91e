// src/commands.rs
// Typed surface for the command ingress. The chat front-end owns parsing and
// rendering; the engine consumes only the resulting store mutations, each of
// which is a single call here. The multi-step alert flow walks the persisted
// conversation state machine so a restart never loses a half-built alert.

use crate::conversation::{conversation_ttl, ConversationStep};
use crate::database::{self, Alert, DbPool, Position};
use crate::errors::{MonitorError, Result};
use crate::utils::format_percent;
use chrono::Utc;
use serde_json::json;

/// A mutation requested through the chat front-end.
#[derive(Debug, Clone)]
pub enum Command {
    /// First contact; creates the user row.
    Start,
    SetWallet { address: String },
    SignAlert { alert_id: i64 },
    PauseAlert { alert_id: i64 },
    ResumeAlert { alert_id: i64 },
    DeleteAlert { alert_id: i64 },
    ListAlerts,
    ListPositions,
}

/// What the front-end should render back to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Ack(String),
    Alerts(Vec<Alert>),
    Positions(Vec<Position>),
}

/// Applies one single-shot command for the user behind `channel_id`.
pub async fn apply(db: &DbPool, channel_id: &str, command: Command) -> Result<CommandReply> {
    let user_id = database::upsert_user(db, channel_id).await?;
    match command {
        Command::Start => Ok(CommandReply::Ack(
            "👋 You're set up. Add a wallet to track positions, or create an alert.".into(),
        )),
        Command::SetWallet { address } => {
            database::set_user_wallet(db, channel_id, &address).await?;
            Ok(CommandReply::Ack(format!("✅ Wallet saved: {}", address)))
        }
        Command::SignAlert { alert_id } => {
            database::sign_alert(db, alert_id).await?;
            Ok(CommandReply::Ack("✅ Alert signed and live.".into()))
        }
        Command::PauseAlert { alert_id } => {
            database::set_alert_active(db, alert_id, false).await?;
            Ok(CommandReply::Ack("⏸️ Alert paused.".into()))
        }
        Command::ResumeAlert { alert_id } => {
            database::set_alert_active(db, alert_id, true).await?;
            Ok(CommandReply::Ack("▶️ Alert resumed.".into()))
        }
        Command::DeleteAlert { alert_id } => {
            database::delete_alert(db, alert_id).await?;
            Ok(CommandReply::Ack("🗑️ Alert deleted.".into()))
        }
        Command::ListAlerts => Ok(CommandReply::Alerts(
            database::get_alerts_for_user(db, user_id).await?,
        )),
        Command::ListPositions => Ok(CommandReply::Positions(
            database::load_active_positions_for_user(db, user_id).await?,
        )),
    }
}

/// Where the alert-creation conversation stands after one input.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowReply {
    /// Prompt for the next step.
    Prompt(String),
    /// Flow finished; the draft alert exists and awaits signing.
    Created { alert_id: i64 },
    /// Input rejected; same step prompts again.
    Invalid(String),
}

/// Starts the alert-creation flow for a user.
pub async fn begin_alert_flow(db: &DbPool, channel_id: &str) -> Result<FlowReply> {
    let user_id = database::upsert_user(db, channel_id).await?;
    database::put_conversation_state(
        db,
        user_id,
        ConversationStep::AwaitingAsset.as_str(),
        &json!({}),
        Utc::now(),
    )
    .await?;
    Ok(FlowReply::Prompt(
        "Which asset should the alert watch? (symbol, or ALL)".into(),
    ))
}

/// Feeds one user input into the persisted flow and advances it.
pub async fn advance_alert_flow(db: &DbPool, channel_id: &str, input: &str) -> Result<FlowReply> {
    let user_id = database::upsert_user(db, channel_id).await?;
    let now = Utc::now();
    let state = database::get_conversation_state(db, user_id, conversation_ttl(), now)
        .await?
        .ok_or_else(|| {
            MonitorError::StoreConflict("no conversation in progress (or it expired)".into())
        })?;
    let step = ConversationStep::from_str(&state.step).ok_or_else(|| {
        MonitorError::StoreFatal(format!("corrupt conversation step: {}", state.step))
    })?;

    let mut partial = state.partial_input;
    if !partial.is_object() {
        partial = json!({});
    }
    let input = input.trim();

    let next = match step {
        ConversationStep::AwaitingAsset => {
            let symbol = input.to_uppercase();
            if symbol.is_empty() || symbol.len() > 12 {
                return Ok(FlowReply::Invalid("That doesn't look like a symbol.".into()));
            }
            partial["asset"] = json!(symbol);
            FlowReply::Prompt("Minimum APY in percent? (e.g. 5.0)".into())
        }
        ConversationStep::AwaitingMinApy => {
            let Ok(min_apy) = input.parse::<f64>() else {
                return Ok(FlowReply::Invalid("Please send a number, e.g. 5.0".into()));
            };
            if min_apy < 0.0 {
                return Ok(FlowReply::Invalid("Minimum APY can't be negative.".into()));
            }
            partial["min_apy"] = json!(min_apy);
            FlowReply::Prompt("Risk appetite? (Low / Medium / High)".into())
        }
        ConversationStep::AwaitingRisk => {
            let label = match input.to_lowercase().as_str() {
                "low" => "Low",
                "medium" => "Medium",
                "high" => "High",
                _ => return Ok(FlowReply::Invalid("Pick Low, Medium or High.".into())),
            };
            partial["risk"] = json!(label);
            FlowReply::Prompt("Maximum amount to consider, in the asset's units? (or 'skip')".into())
        }
        ConversationStep::AwaitingNotional => {
            if !input.eq_ignore_ascii_case("skip") {
                let Ok(notional) = input.parse::<f64>() else {
                    return Ok(FlowReply::Invalid("Send a number or 'skip'.".into()));
                };
                partial["max_notional"] = json!(notional);
            }
            let asset = partial["asset"].as_str().unwrap_or("ALL").to_string();
            let min_apy = partial["min_apy"].as_f64().unwrap_or(0.0);
            FlowReply::Prompt(format!(
                "Create alert for {} at ≥ {}? (yes / no)",
                asset,
                format_percent(min_apy)
            ))
        }
        ConversationStep::ConfirmingAlert => {
            if !input.eq_ignore_ascii_case("yes") {
                database::clear_conversation_state(db, user_id).await?;
                return Ok(FlowReply::Prompt("Discarded. Nothing was saved.".into()));
            }
            let asset = partial["asset"].as_str().unwrap_or("ALL").to_string();
            let min_apy = partial["min_apy"].as_f64().unwrap_or(0.0);
            let risk = partial["risk"].as_str().unwrap_or("Medium").to_string();
            let max_notional = partial["max_notional"].as_f64();
            let alert_id =
                database::create_alert(db, user_id, &asset, min_apy, &risk, max_notional).await?;
            database::clear_conversation_state(db, user_id).await?;
            return Ok(FlowReply::Created { alert_id });
        }
    };

    // Persist the advanced state. ConfirmingAlert returns above, so next()
    // is always present here.
    if let Some(next_step) = step.next() {
        database::put_conversation_state(db, user_id, next_step.as_str(), &partial, now).await?;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_in_memory;

    #[tokio::test]
    async fn single_shot_commands_mutate_the_store() {
        let db = connect_in_memory().await.unwrap();

        let reply = apply(&db, "chat-c1", Command::Start).await.unwrap();
        assert!(matches!(reply, CommandReply::Ack(_)));

        apply(
            &db,
            "chat-c1",
            Command::SetWallet {
                address: "0xAb5801a7D398351b8bE11C439e05C5b3259AeC9B".into(),
            },
        )
        .await
        .unwrap();
        let users = database::get_users_with_wallets(&db).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(
            users[0].wallet_address.as_deref(),
            Some("0xab5801a7d398351b8be11c439e05c5b3259aec9b")
        );

        let bad = apply(
            &db,
            "chat-c1",
            Command::SetWallet {
                address: "not-a-wallet".into(),
            },
        )
        .await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn alert_flow_walks_every_step_and_creates_a_draft() {
        let db = connect_in_memory().await.unwrap();

        assert!(matches!(
            begin_alert_flow(&db, "chat-c2").await.unwrap(),
            FlowReply::Prompt(_)
        ));

        assert!(matches!(
            advance_alert_flow(&db, "chat-c2", "usdc").await.unwrap(),
            FlowReply::Prompt(_)
        ));
        // invalid number re-prompts without advancing
        assert!(matches!(
            advance_alert_flow(&db, "chat-c2", "plenty").await.unwrap(),
            FlowReply::Invalid(_)
        ));
        assert!(matches!(
            advance_alert_flow(&db, "chat-c2", "5.0").await.unwrap(),
            FlowReply::Prompt(_)
        ));
        assert!(matches!(
            advance_alert_flow(&db, "chat-c2", "low").await.unwrap(),
            FlowReply::Prompt(_)
        ));
        assert!(matches!(
            advance_alert_flow(&db, "chat-c2", "skip").await.unwrap(),
            FlowReply::Prompt(_)
        ));

        let done = advance_alert_flow(&db, "chat-c2", "yes").await.unwrap();
        let FlowReply::Created { alert_id } = done else {
            panic!("expected a created alert, got {:?}", done);
        };

        let user_id = database::upsert_user(&db, "chat-c2").await.unwrap();
        let alerts = database::get_alerts_for_user(&db, user_id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, alert_id);
        assert_eq!(alerts[0].asset_symbol, "USDC");
        assert_eq!(alerts[0].min_apy, 5.0);
        assert_eq!(alerts[0].risk_label, "Low");
        assert!(!alerts[0].signed, "flow produces a draft; signing is separate");

        // conversation state is gone
        assert!(database::get_conversation_state(
            &db,
            user_id,
            crate::conversation::conversation_ttl(),
            Utc::now()
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn declining_the_confirmation_discards_the_draft() {
        let db = connect_in_memory().await.unwrap();
        begin_alert_flow(&db, "chat-c3").await.unwrap();
        advance_alert_flow(&db, "chat-c3", "WETH").await.unwrap();
        advance_alert_flow(&db, "chat-c3", "3").await.unwrap();
        advance_alert_flow(&db, "chat-c3", "High").await.unwrap();
        advance_alert_flow(&db, "chat-c3", "250000").await.unwrap();
        advance_alert_flow(&db, "chat-c3", "no").await.unwrap();

        let user_id = database::upsert_user(&db, "chat-c3").await.unwrap();
        assert!(database::get_alerts_for_user(&db, user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn advancing_without_a_flow_is_a_conflict() {
        let db = connect_in_memory().await.unwrap();
        database::upsert_user(&db, "chat-c4").await.unwrap();
        let err = advance_alert_flow(&db, "chat-c4", "USDC").await;
        assert!(matches!(err, Err(MonitorError::StoreConflict(_))));
    }
}

// Shared test doubles: a gateway that records deliveries, a scripted pool
// source and a scripted balance reader, wired into a real engine over an
// in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, U256};
use lendwatch::chain_client::{BalanceReader, ChainClients};
use lendwatch::chains::Chain;
use lendwatch::database::{self, DbPool};
use lendwatch::engine::Engine;
use lendwatch::errors::{MonitorError, Result};
use lendwatch::pool_fetcher::PoolSource;
use lendwatch::pools::PoolRecord;
use lendwatch::settings::Settings;
use lendwatch::telegram::{ChatGateway, MessageAction};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub channel_id: String,
    pub text: String,
    pub action_count: usize,
}

/// Gateway double: records every successful delivery and can be told to fail
/// a channel permanently or a number of times transiently.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<SentMessage>>,
    permanent_failures: Mutex<HashSet<String>>,
    transient_failures: Mutex<HashMap<String, u32>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, channel_id: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.channel_id == channel_id)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn fail_permanently(&self, channel_id: &str) {
        self.permanent_failures
            .lock()
            .unwrap()
            .insert(channel_id.to_string());
    }

    pub fn fail_transiently(&self, channel_id: &str, times: u32) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), times);
    }

    pub fn clear_permanent_failure(&self, channel_id: &str) {
        self.permanent_failures.lock().unwrap().remove(channel_id);
    }
}

#[async_trait]
impl ChatGateway for RecordingGateway {
    async fn send(&self, channel_id: &str, text: &str, actions: &[MessageAction]) -> Result<()> {
        if self.permanent_failures.lock().unwrap().contains(channel_id) {
            return Err(MonitorError::DeliverPermanent(format!(
                "chat not found: {}",
                channel_id
            )));
        }
        {
            let mut transient = self.transient_failures.lock().unwrap();
            if let Some(remaining) = transient.get_mut(channel_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MonitorError::DeliverTransient("rate limited".into()));
                }
            }
        }
        self.sent.lock().unwrap().push(SentMessage {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            action_count: actions.len(),
        });
        Ok(())
    }
}

/// Pool source double: per-chain scripted output, rewritable between ticks.
#[derive(Default)]
pub struct ScriptedPoolSource {
    scripts: Mutex<HashMap<u64, ChainScript>>,
}

#[derive(Clone)]
pub enum ChainScript {
    Pools(Vec<PoolRecord>),
    Fail,
}

impl ScriptedPoolSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_pools(&self, chain: Chain, pools: Vec<PoolRecord>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(chain.id(), ChainScript::Pools(pools));
    }

    pub fn set_failure(&self, chain: Chain) {
        self.scripts
            .lock()
            .unwrap()
            .insert(chain.id(), ChainScript::Fail);
    }

    pub fn clear(&self, chain: Chain) {
        self.scripts.lock().unwrap().remove(&chain.id());
    }
}

#[async_trait]
impl PoolSource for ScriptedPoolSource {
    async fn fetch_pools(&self, chain: Chain) -> Result<Vec<PoolRecord>> {
        let script = self.scripts.lock().unwrap().get(&chain.id()).cloned();
        match script {
            Some(ChainScript::Pools(pools)) => Ok(pools),
            Some(ChainScript::Fail) => Err(MonitorError::RpcPermanent {
                chain,
                message: "scripted outage".into(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Balance reader double: exact share balances per (chain, pool, holder),
/// 1:1 share-to-asset conversion, optional per-slot read failures.
#[derive(Default)]
pub struct ScriptedBalanceReader {
    balances: Mutex<HashMap<(u64, Address, Address), U256>>,
    failing: Mutex<HashSet<(u64, Address, Address)>>,
}

impl ScriptedBalanceReader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_balance(&self, chain: Chain, pool: Address, holder: Address, shares: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert((chain.id(), pool, holder), U256::from(shares));
    }

    pub fn set_read_failure(&self, chain: Chain, pool: Address, holder: Address) {
        self.failing.lock().unwrap().insert((chain.id(), pool, holder));
    }

    pub fn clear_read_failure(&self, chain: Chain, pool: Address, holder: Address) {
        self.failing.lock().unwrap().remove(&(chain.id(), pool, holder));
    }
}

#[async_trait]
impl BalanceReader for ScriptedBalanceReader {
    async fn read_share_balance(
        &self,
        chain: Chain,
        pool: Address,
        holder: Address,
    ) -> Result<U256> {
        if self.failing.lock().unwrap().contains(&(chain.id(), pool, holder)) {
            return Err(MonitorError::RpcTransient {
                chain,
                message: "scripted read failure".into(),
            });
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(chain.id(), pool, holder))
            .copied()
            .unwrap_or_else(U256::zero))
    }

    async fn convert_to_assets(&self, _chain: Chain, _pool: Address, shares: U256) -> Result<U256> {
        Ok(shares)
    }
}

pub struct TestHarness {
    pub engine: Engine,
    pub db: DbPool,
    pub gateway: Arc<RecordingGateway>,
    pub source: Arc<ScriptedPoolSource>,
    pub reader: Arc<ScriptedBalanceReader>,
}

pub async fn build_harness() -> TestHarness {
    let mut settings = Settings::default();
    // keep retry backoff out of the test clock
    settings.notifier.delivery_base_delay_ms = 1;
    let settings = Arc::new(settings);

    let db = database::connect_in_memory().await.expect("in-memory store");
    let gateway = RecordingGateway::new();
    let source = ScriptedPoolSource::new();
    let reader = ScriptedBalanceReader::new();
    let clients = Arc::new(ChainClients::new(settings.clone()));

    let engine = Engine::assemble(
        settings,
        clients,
        source.clone(),
        reader.clone(),
        gateway.clone(),
        db.clone(),
    )
    .expect("engine assembly");

    TestHarness {
        engine,
        db,
        gateway,
        source,
        reader,
    }
}

pub fn addr(suffix: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = suffix;
    Address::from(bytes)
}

pub fn wallet(suffix: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0xee;
    bytes[19] = suffix;
    Address::from(bytes)
}

pub fn wallet_string(suffix: u8) -> String {
    format!("{:?}", wallet(suffix))
}

/// A plausible pool record: 1.25M TVL at 40% utilization unless overridden.
pub fn pool(address: Address, chain: Chain, underlying: &str, apy: f64) -> PoolRecord {
    PoolRecord {
        address,
        chain,
        name: format!("{} Lending Pool", underlying),
        symbol: format!("d{}", underlying),
        underlying_address: Address::from_str("0x00000000000000000000000000000000000000ff")
            .unwrap(),
        underlying_symbol: underlying.to_string(),
        decimals: 6,
        tvl: U256::from(1_250_000u64) * U256::exp10(6),
        apy,
        borrow_apy: apy * 1.4,
        borrowed: U256::from(500_000u64) * U256::exp10(6),
        utilization: 40.0,
        collaterals: vec![],
    }
}

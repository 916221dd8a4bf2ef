//! Profit allocation
//!
//! A closed position's realized P&L is split into compound, buyback and burn
//! buckets. The split is written to the position book together with the
//! close; crediting the external buckets afterwards is idempotent per
//! `(position, bucket)` so it can be retried freely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{lamports_to_sol, AllocationConfig, BPS_DENOMINATOR};
use crate::error::Result;
use crate::store::JsonStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Compound,
    Buyback,
    Burn,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Compound, Bucket::Buyback, Bucket::Burn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Compound => "compound",
            Bucket::Buyback => "buyback",
            Bucket::Burn => "burn",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one closed position's P&L was split; immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub position_id: String,
    pub realized_pnl: i64,
    pub compound_amount: u64,
    pub buyback_amount: u64,
    pub burn_amount: u64,
    pub created_at: DateTime<Utc>,
}

impl AllocationRecord {
    pub fn total(&self) -> u64 {
        self.compound_amount + self.buyback_amount + self.burn_amount
    }

    pub fn amount(&self, bucket: Bucket) -> u64 {
        match bucket {
            Bucket::Compound => self.compound_amount,
            Bucket::Buyback => self.buyback_amount,
            Bucket::Burn => self.burn_amount,
        }
    }
}

/// Split realized P&L by basis points; rounding remainder goes to compound
pub fn split(position_id: &str, realized_pnl: i64, config: &AllocationConfig) -> AllocationRecord {
    let (compound, buyback, burn) = if realized_pnl > 0 {
        let pnl = realized_pnl as u128;
        let buyback = (pnl * config.buyback_bps as u128 / BPS_DENOMINATOR as u128) as u64;
        let burn = (pnl * config.burn_bps as u128 / BPS_DENOMINATOR as u128) as u64;
        (realized_pnl as u64 - buyback - burn, buyback, burn)
    } else {
        (0, 0, 0)
    };

    AllocationRecord {
        position_id: position_id.to_string(),
        realized_pnl,
        compound_amount: compound,
        buyback_amount: buyback,
        burn_amount: burn,
        created_at: Utc::now(),
    }
}

/// Idempotency key for crediting one bucket from one position
pub fn idempotency_key(position_id: &str, bucket: Bucket) -> String {
    let digest = Sha256::digest(format!("{}:{}", position_id, bucket).as_bytes());
    format!("{:x}", digest)
}

/// External bucket ledger: "credit bucket X with amount Y"
#[async_trait]
pub trait BucketLedger: Send + Sync {
    /// Returns false when the key was already applied
    async fn credit(&self, bucket: Bucket, amount: u64, idempotency_key: &str) -> Result<bool>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct BucketState {
    balances: BTreeMap<Bucket, u64>,
    applied: BTreeSet<String>,
}

/// Bucket balances kept in `buckets.json`
pub struct JsonBucketLedger {
    state: Mutex<BucketState>,
    store: JsonStore,
}

impl JsonBucketLedger {
    pub async fn open(store: JsonStore) -> Result<Self> {
        let state: BucketState = store.load().await?;
        Ok(Self {
            state: Mutex::new(state),
            store,
        })
    }

    pub async fn balance(&self, bucket: Bucket) -> u64 {
        self.state
            .lock()
            .await
            .balances
            .get(&bucket)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BucketLedger for JsonBucketLedger {
    async fn credit(&self, bucket: Bucket, amount: u64, idempotency_key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.applied.contains(idempotency_key) {
            debug!(%bucket, "Bucket credit already applied");
            return Ok(false);
        }

        let before = state.clone();
        *state.balances.entry(bucket).or_insert(0) += amount;
        state.applied.insert(idempotency_key.to_string());

        if let Err(e) = self.store.save(&*state).await {
            *state = before;
            return Err(e);
        }
        Ok(true)
    }
}

pub struct ProfitAllocator {
    config: AllocationConfig,
    ledger: Arc<dyn BucketLedger>,
}

impl ProfitAllocator {
    pub fn new(config: AllocationConfig, ledger: Arc<dyn BucketLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn split(&self, position_id: &str, realized_pnl: i64) -> AllocationRecord {
        split(position_id, realized_pnl, &self.config)
    }

    /// Credit every non-zero bucket of a record; safe to call repeatedly
    pub async fn credit(&self, record: &AllocationRecord) -> Result<()> {
        for bucket in Bucket::ALL {
            let amount = record.amount(bucket);
            if amount == 0 {
                continue;
            }
            let key = idempotency_key(&record.position_id, bucket);
            if self.ledger.credit(bucket, amount, &key).await? {
                info!(
                    position_id = %record.position_id,
                    %bucket,
                    amount_sol = lamports_to_sol(amount as i64),
                    "Bucket credited"
                );
            }
        }
        Ok(())
    }
}

//! Price source for position monitoring
//!
//! WARNING: exits are best-effort. At multi-second polling a fast rug can
//! gap through the stop loss before it is seen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::signal::dexscreener::DexScreenerClient;
use crate::signal::TokenKey;

/// Current market view of one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Native quote asset (SOL) per token
    pub price: f64,
    pub liquidity_usd: Option<f64>,
    /// When the upstream observed this price
    pub observed_at: DateTime<Utc>,
}

impl PriceQuote {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.observed_at
    }
}

/// "Get current price for token"
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn quote(&self, token: &TokenKey) -> Result<PriceQuote>;
}

/// Quotes from the deepest DexScreener pair
pub struct DexScreenerPriceSource {
    client: DexScreenerClient,
}

impl DexScreenerPriceSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: DexScreenerClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl PriceSource for DexScreenerPriceSource {
    async fn quote(&self, token: &TokenKey) -> Result<PriceQuote> {
        let pair = self
            .client
            .get_token_pair(token)
            .await?
            .ok_or_else(|| Error::PriceUnavailable(token.to_string()))?;

        let price = pair
            .native_price()
            .ok_or_else(|| Error::PriceUnavailable(format!("{} has no native price", token)))?;

        debug!(token = %token, price, liquidity = ?pair.liquidity_usd(), "Price polled");

        Ok(PriceQuote {
            price,
            liquidity_usd: pair.liquidity_usd(),
            // DexScreener does not timestamp quotes; treat as observed now
            observed_at: Utc::now(),
        })
    }
}

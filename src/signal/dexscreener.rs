// DexScreener API client and polling adapters
//
// Latest token profiles are treated as social attention, top boosts as
// on-chain paid promotion. The same client backs the price source.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::adapter::{SignalSink, SourceAdapter};
use super::{Observation, SourceKind, TokenKey};
use crate::config::SourceConfig;
use crate::error::{Error, Result};

pub const DEXSCREENER_BASE: &str = "https://api.dexscreener.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenProfile {
    pub url: Option<String>,
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "tokenAddress")]
    pub token_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBoost {
    pub url: Option<String>,
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "tokenAddress")]
    pub token_address: String,
    #[serde(rename = "totalAmount")]
    pub total_amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
    pub base: Option<f64>,
    pub quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    #[serde(rename = "priceNative")]
    pub price_native: Option<String>,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    pub liquidity: Option<Liquidity>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
}

impl DexPair {
    /// Price in the quote (native) asset
    pub fn native_price(&self) -> Option<f64> {
        self.price_native
            .as_ref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
    }

    pub fn liquidity_usd(&self) -> Option<f64> {
        self.liquidity.as_ref().and_then(|l| l.usd)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

pub struct DexScreenerClient {
    client: reqwest::Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("{} returned {}", path, resp.status())));
        }
        Ok(resp.json().await?)
    }

    /// Fetch latest token profiles
    pub async fn get_latest_profiles(&self) -> Result<Vec<TokenProfile>> {
        self.get_json("/token-profiles/latest/v1").await
    }

    /// Fetch top boosted tokens
    pub async fn get_top_boosts(&self) -> Result<Vec<TokenBoost>> {
        self.get_json("/token-boosts/top/v1").await
    }

    /// Fetch the most liquid pair for a token
    pub async fn get_token_pair(&self, token: &TokenKey) -> Result<Option<DexPair>> {
        let data: TokenPairsResponse = self
            .get_json(&format!("/latest/dex/tokens/{}", token.address))
            .await?;

        Ok(best_pair(data.pairs.unwrap_or_default(), &token.chain))
    }
}

/// Pick the deepest pair on the token's chain
fn best_pair(pairs: Vec<DexPair>, chain: &str) -> Option<DexPair> {
    pairs
        .into_iter()
        .filter(|p| p.chain_id.eq_ignore_ascii_case(chain))
        .max_by(|a, b| {
            let la = a.liquidity_usd().unwrap_or(0.0);
            let lb = b.liquidity_usd().unwrap_or(0.0);
            la.total_cmp(&lb)
        })
}

/// Polling adapter over DexScreener discovery endpoints
pub struct DexScreenerAdapter {
    id: String,
    kind: SourceKind,
    client: DexScreenerClient,
    poll_interval: Duration,
}

impl DexScreenerAdapter {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        if !matches!(config.kind, SourceKind::Social | SourceKind::OnChain) {
            return Err(Error::Config(format!(
                "DexScreener adapter cannot serve {} source {}",
                config.kind, config.id
            )));
        }

        let base = config.url.as_deref().unwrap_or(DEXSCREENER_BASE);
        Ok(Self {
            id: config.id.clone(),
            kind: config.kind,
            client: DexScreenerClient::new(base, Duration::from_secs(10))?,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        })
    }

    async fn poll(&self) -> Result<Vec<Observation>> {
        let entries: Vec<(String, String, Option<String>)> = match self.kind {
            SourceKind::OnChain => self
                .client
                .get_top_boosts()
                .await?
                .into_iter()
                .map(|b| (b.chain_id, b.token_address, b.url))
                .collect(),
            _ => self
                .client
                .get_latest_profiles()
                .await?
                .into_iter()
                .map(|p| (p.chain_id, p.token_address, p.url))
                .collect(),
        };

        Ok(normalize_entries(entries))
    }
}

/// Normalize raw (chain, address, url) entries, once per token
fn normalize_entries(entries: Vec<(String, String, Option<String>)>) -> Vec<Observation> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|(chain, address, url)| {
            let token = TokenKey::parse(&chain, &address).ok()?;
            if !seen.insert(token.clone()) {
                return None;
            }
            let raw_ref = url.unwrap_or_else(|| token.to_string());
            Some(Observation::now(token, raw_ref))
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for DexScreenerAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn run_session(&self, sink: &SignalSink) -> Result<()> {
        info!(source = %self.id, "Polling DexScreener every {:?}", self.poll_interval);

        loop {
            let observations = self.poll().await.map_err(|e| Error::SourceUnavailable {
                source_id: self.id.clone(),
                reason: e.to_string(),
            })?;
            sink.mark_connected();

            debug!(source = %self.id, "Poll returned {} tokens", observations.len());
            for observation in observations {
                sink.emit(observation).await?;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    fn pair(chain: &str, liquidity: f64, price: &str) -> DexPair {
        DexPair {
            chain_id: chain.into(),
            dex_id: "raydium".into(),
            pair_address: "pair".into(),
            base_token: BaseToken {
                address: MINT.into(),
                name: None,
                symbol: None,
            },
            price_native: Some(price.into()),
            price_usd: None,
            liquidity: Some(Liquidity {
                usd: Some(liquidity),
                base: None,
                quote: None,
            }),
            market_cap: None,
        }
    }

    #[test]
    fn test_best_pair_prefers_deepest_on_chain() {
        let pairs = vec![
            pair("solana", 5_000.0, "0.1"),
            pair("solana", 50_000.0, "0.2"),
            pair("base", 900_000.0, "0.3"),
        ];
        let best = best_pair(pairs, "solana").unwrap();
        assert_eq!(best.native_price(), Some(0.2));
        assert_eq!(best.liquidity_usd(), Some(50_000.0));
    }

    #[test]
    fn test_native_price_rejects_garbage() {
        assert_eq!(pair("solana", 1.0, "abc").native_price(), None);
        assert_eq!(pair("solana", 1.0, "0").native_price(), None);
    }

    #[test]
    fn test_normalize_entries_dedupes_and_drops_invalid() {
        let entries = vec![
            ("solana".to_string(), MINT.to_string(), Some("https://x/1".to_string())),
            ("solana".to_string(), MINT.to_string(), None),
            ("solana".to_string(), "bogus".to_string(), None),
            ("unknownchain".to_string(), MINT.to_string(), None),
        ];
        let observations = normalize_entries(entries);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].raw_ref, "https://x/1");
    }

    #[test]
    fn test_parse_pairs_response() {
        let json = r#"{"pairs":[{"chainId":"solana","dexId":"pumpswap","pairAddress":"p1",
            "baseToken":{"address":"DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK"},
            "priceNative":"0.0000312","liquidity":{"usd":42000.5}}]}"#;
        let data: TokenPairsResponse = serde_json::from_str(json).unwrap();
        let pair = best_pair(data.pairs.unwrap(), "solana").unwrap();
        assert_eq!(pair.liquidity_usd(), Some(42000.5));
        assert!((pair.native_price().unwrap() - 0.0000312).abs() < 1e-12);
    }
}

//! Swap executors
//!
//! `PumpPortalExecutor` submits trades through the PumpPortal Lightning
//! API. `PaperExecutor` fills against the current quote without touching
//! the chain.
//!
//! Fee: 0.5% per trade on PumpPortal

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BuyOrder, Fill, SellOrder};
use crate::config::{lamports_to_sol, sol_to_lamports, ExecutionConfig, BPS_DENOMINATOR};
use crate::error::{Error, Result};
use crate::position::PriceSource;
use crate::signal::TokenKey;

/// "Execute swap(token, amount, direction, slippage bound)"
#[async_trait]
pub trait SwapExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn buy(&self, order: &BuyOrder) -> Result<Fill>;

    async fn sell(&self, order: &SellOrder) -> Result<Fill>;
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TradeRequest {
    action: TradeAction,
    mint: String,
    /// SOL for buys, tokens or a percentage for sells
    amount: String,
    denominated_in_sol: String,
    /// Percent
    slippage: u32,
    priority_fee: f64,
    pool: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct TradeResponse {
    signature: Option<String>,
    error: Option<String>,
    errors: Option<Vec<String>>,
}

/// Errors the venue reports that retrying cannot fix
const FATAL_MARKERS: [&str; 6] = [
    "insufficient",
    "invalid",
    "not found",
    "unauthorized",
    "api key",
    "bonding curve complete",
];

/// Classify an error message from the trade API
fn classify(message: String) -> Error {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        Error::SubmissionFatal(message)
    } else {
        Error::SubmissionTransient(message)
    }
}

fn bps_to_pct(bps: u32) -> u32 {
    (bps as u64 * 100 / BPS_DENOMINATOR).max(1) as u32
}

/// Trades through the PumpPortal Lightning API
///
/// The API returns only a signature, so fill amounts are estimated from a
/// quote taken just before submission.
pub struct PumpPortalExecutor {
    client: Client,
    api_url: String,
    api_key: String,
    priority_fee: f64,
    prices: Arc<dyn PriceSource>,
}

impl PumpPortalExecutor {
    pub fn new(config: &ExecutionConfig, prices: Arc<dyn PriceSource>) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "execution.api_key is required for live trading".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.attempt_timeout_ms))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.trade_api_url.clone(),
            api_key: config.api_key.clone(),
            priority_fee: config.priority_fee_sol,
            prices,
        })
    }

    async fn submit(&self, request: &TradeRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .query(&[("api-key", self.api_key.as_str())])
            .json(request)
            .send()
            .await
            .map_err(|e| Error::SubmissionTransient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::SubmissionTransient(format!("trade API returned {}", status)));
        }

        let body: TradeResponse = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = body.error {
            return Err(classify(error));
        }
        if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
            return Err(classify(errors.join(", ")));
        }
        if status.is_client_error() {
            return Err(Error::SubmissionFatal(format!("trade API returned {}", status)));
        }

        body.signature
            .ok_or_else(|| Error::SubmissionTransient("No signature in response".to_string()))
    }

    async fn price(&self, order_token: &TokenKey) -> Result<f64> {
        let quote = self
            .prices
            .quote(order_token)
            .await
            .map_err(|e| Error::SubmissionTransient(format!("no quote for fill estimate: {}", e)))?;
        if quote.price <= 0.0 {
            return Err(Error::SubmissionTransient(format!(
                "unusable quote {} for {}",
                quote.price, order_token
            )));
        }
        Ok(quote.price)
    }
}

#[async_trait]
impl SwapExecutor for PumpPortalExecutor {
    fn name(&self) -> &str {
        "pumpportal"
    }

    async fn buy(&self, order: &BuyOrder) -> Result<Fill> {
        let price = self.price(&order.token).await?;
        let sol = lamports_to_sol(order.lamports as i64);

        let request = TradeRequest {
            action: TradeAction::Buy,
            mint: order.token.address.clone(),
            amount: sol.to_string(),
            denominated_in_sol: "true".to_string(),
            slippage: bps_to_pct(order.slippage_bps),
            priority_fee: self.priority_fee,
            pool: "auto",
        };

        info!("Executing buy: {} SOL for token {}", sol, order.token);
        let signature = self.submit(&request).await?;

        Ok(Fill::new(signature, sol / price, order.lamports))
    }

    async fn sell(&self, order: &SellOrder) -> Result<Fill> {
        let price = self.price(&order.token).await?;

        let amount = if order.sell_all {
            "100%".to_string()
        } else {
            order.token_amount.to_string()
        };

        let request = TradeRequest {
            action: TradeAction::Sell,
            mint: order.token.address.clone(),
            amount,
            denominated_in_sol: "false".to_string(),
            slippage: bps_to_pct(order.slippage_bps),
            priority_fee: self.priority_fee,
            pool: "auto",
        };

        info!("Executing sell: {} of token {}", request.amount, order.token);
        let signature = self.submit(&request).await?;

        let lamports = sol_to_lamports(order.token_amount * price);
        Ok(Fill::new(signature, order.token_amount, lamports))
    }
}

/// Fills at the current quote less a fixed slippage
pub struct PaperExecutor {
    prices: Arc<dyn PriceSource>,
    slippage_bps: u32,
}

impl PaperExecutor {
    pub fn new(prices: Arc<dyn PriceSource>, slippage_bps: u32) -> Self {
        Self {
            prices,
            slippage_bps,
        }
    }

    fn slippage(&self) -> f64 {
        self.slippage_bps as f64 / BPS_DENOMINATOR as f64
    }

    async fn price(&self, token: &TokenKey) -> Result<f64> {
        let quote = self.prices.quote(token).await?;
        if quote.price <= 0.0 {
            return Err(Error::PriceUnavailable(token.to_string()));
        }
        Ok(quote.price)
    }
}

#[async_trait]
impl SwapExecutor for PaperExecutor {
    fn name(&self) -> &str {
        "paper"
    }

    async fn buy(&self, order: &BuyOrder) -> Result<Fill> {
        let price = self.price(&order.token).await? * (1.0 + self.slippage());
        let tokens = lamports_to_sol(order.lamports as i64) / price;
        debug!(token = %order.token, tokens, "Paper buy");
        Ok(Fill::new(format!("paper-{}", Uuid::new_v4()), tokens, order.lamports))
    }

    async fn sell(&self, order: &SellOrder) -> Result<Fill> {
        let price = self.price(&order.token).await? * (1.0 - self.slippage());
        let lamports = sol_to_lamports(order.token_amount * price);
        debug!(token = %order.token, lamports, "Paper sell");
        Ok(Fill::new(
            format!("paper-{}", Uuid::new_v4()),
            order.token_amount,
            lamports,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PriceQuote;
    use chrono::Utc;

    struct FixedPrice(f64);

    #[async_trait]
    impl PriceSource for FixedPrice {
        async fn quote(&self, _token: &TokenKey) -> Result<PriceQuote> {
            Ok(PriceQuote {
                price: self.0,
                liquidity_usd: None,
                observed_at: Utc::now(),
            })
        }
    }

    fn token() -> TokenKey {
        TokenKey::parse("solana", "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK").unwrap()
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify("Insufficient funds for trade".into()),
            Error::SubmissionFatal(_)
        ));
        assert!(matches!(
            classify("Blockhash not confirmed in time".into()),
            Error::SubmissionTransient(_)
        ));
    }

    #[test]
    fn test_trade_request_serialization() {
        let request = TradeRequest {
            action: TradeAction::Buy,
            mint: "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK".to_string(),
            amount: "0.1".to_string(),
            denominated_in_sol: "true".to_string(),
            slippage: bps_to_pct(2500),
            priority_fee: 0.0005,
            pool: "auto",
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"action\":\"buy\""));
        assert!(json.contains("\"denominatedInSol\":\"true\""));
        assert!(json.contains("\"slippage\":25"));
    }

    #[test]
    fn test_live_executor_requires_api_key() {
        let result = PumpPortalExecutor::new(&ExecutionConfig::default(), Arc::new(FixedPrice(1.0)));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_paper_fills_apply_slippage() {
        let paper = PaperExecutor::new(Arc::new(FixedPrice(0.0001)), 100);

        let buy = paper
            .buy(&BuyOrder {
                token: token(),
                lamports: 101_000_000,
                slippage_bps: 2500,
            })
            .await
            .unwrap();
        assert!((buy.token_amount - 1_000.0).abs() < 1e-6);
        assert_eq!(buy.lamports, 101_000_000);

        let sell = paper
            .sell(&SellOrder {
                token: token(),
                token_amount: 1_000.0,
                sell_all: true,
                slippage_bps: 2500,
            })
            .await
            .unwrap();
        assert_eq!(sell.lamports, 99_000_000);
        assert!(sell.signature.starts_with("paper-"));
    }
}

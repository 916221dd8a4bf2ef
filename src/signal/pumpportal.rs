//! PumpPortal WebSocket adapter
//!
//! Serves two feeds from the same endpoint:
//! - `new_listing`: every token creation (`subscribeNewToken`)
//! - `wallet_copy`: buys by tracked wallets (`subscribeAccountTrade`)
//!
//! WebSocket endpoint: wss://pumpportal.fun/api/data

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::adapter::{SignalSink, SourceAdapter};
use super::{Observation, SourceKind, TokenKey};
use crate::config::SourceConfig;
use crate::error::{Error, Result};

/// PumpPortal WebSocket URL
pub const PUMPPORTAL_WS_URL: &str = "wss://pumpportal.fun/api/data";

/// Subscription methods
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMessage {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl SubscriptionMessage {
    /// Subscribe to new token creation events
    pub fn subscribe_new_tokens() -> Self {
        Self {
            method: "subscribeNewToken".to_string(),
            keys: None,
        }
    }

    /// Subscribe to trades by specific accounts (wallets)
    pub fn subscribe_account_trades(wallets: Vec<String>) -> Self {
        Self {
            method: "subscribeAccountTrade".to_string(),
            keys: Some(wallets),
        }
    }
}

/// New token event from PumpPortal
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTokenEvent {
    pub signature: String,
    pub mint: String,
    pub trader_public_key: String,
    pub tx_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
}

/// Trade event from PumpPortal
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub signature: String,
    pub mint: String,
    pub trader_public_key: String,
    pub tx_type: String, // "buy" or "sell"
    pub sol_amount: u64,
}

/// PumpPortal feed adapter
pub struct PumpPortalAdapter {
    id: String,
    kind: SourceKind,
    ws_url: String,
    tracked_wallets: HashSet<String>,
    ping_interval: Duration,
}

impl PumpPortalAdapter {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        if !matches!(config.kind, SourceKind::NewListing | SourceKind::WalletCopy) {
            return Err(Error::Config(format!(
                "PumpPortal adapter cannot serve {} source {}",
                config.kind, config.id
            )));
        }
        if config.kind == SourceKind::WalletCopy && config.tracked_wallets.is_empty() {
            return Err(Error::Config(format!(
                "wallet_copy source {} has no tracked_wallets",
                config.id
            )));
        }

        Ok(Self {
            id: config.id.clone(),
            kind: config.kind,
            ws_url: config
                .url
                .clone()
                .unwrap_or_else(|| PUMPPORTAL_WS_URL.to_string()),
            tracked_wallets: config.tracked_wallets.iter().cloned().collect(),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
        })
    }

    fn subscription(&self) -> SubscriptionMessage {
        match self.kind {
            SourceKind::WalletCopy => SubscriptionMessage::subscribe_account_trades(
                self.tracked_wallets.iter().cloned().collect(),
            ),
            _ => SubscriptionMessage::subscribe_new_tokens(),
        }
    }

    /// Turn one raw message into an observation, if it is relevant to this feed
    fn parse_message(&self, text: &str) -> Option<Observation> {
        match self.kind {
            SourceKind::NewListing => {
                let event = serde_json::from_str::<NewTokenEvent>(text).ok()?;
                if event.tx_type != "create" {
                    return None;
                }
                let token = TokenKey::parse("solana", &event.mint).ok()?;
                debug!("New token: {} ({}) - {}", event.name, event.symbol, event.mint);
                Some(Observation::now(token, event.signature))
            }
            SourceKind::WalletCopy => {
                let event = serde_json::from_str::<TradeEvent>(text).ok()?;
                if event.tx_type != "buy" || !self.tracked_wallets.contains(&event.trader_public_key)
                {
                    return None;
                }
                let token = TokenKey::parse("solana", &event.mint).ok()?;
                debug!(
                    "Tracked wallet {} bought {} for {} SOL",
                    event.trader_public_key,
                    event.mint,
                    event.sol_amount as f64 / 1e9
                );
                Some(Observation::now(token, event.signature))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl SourceAdapter for PumpPortalAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn run_session(&self, sink: &SignalSink) -> Result<()> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {}", e)))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::SourceConnection(format!("WebSocket connect failed: {}", e)))?;

        info!(source = %self.id, "Connected to PumpPortal WebSocket");
        sink.mark_connected();

        let (mut write, mut read) = ws_stream.split();

        let json = serde_json::to_string(&self.subscription())?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::SourceConnection(format!("Failed to subscribe: {}", e)))?;

        let mut ping_timer = tokio::time::interval(self.ping_interval);

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    write
                        .send(Message::Ping(vec![]))
                        .await
                        .map_err(|e| Error::SourceConnection(format!("Failed to send ping: {}", e)))?;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(observation) = self.parse_message(&text) {
                                sink.emit(observation).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!(source = %self.id, "WebSocket closed by server");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            warn!(source = %self.id, "WebSocket error: {}", e);
                            return Err(Error::SourceConnection(e.to_string()));
                        }
                        None => {
                            info!(source = %self.id, "WebSocket stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";
    const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn source(kind: SourceKind, wallets: Vec<String>) -> SourceConfig {
        SourceConfig {
            id: "pp".into(),
            kind,
            weight: 0.4,
            enabled: true,
            url: None,
            tracked_wallets: wallets,
            poll_interval_secs: 30,
            ping_interval_secs: 30,
        }
    }

    #[test]
    fn test_subscription_message_account_trades() {
        let msg = SubscriptionMessage::subscribe_account_trades(vec![WALLET.to_string()]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("subscribeAccountTrade"));
        assert!(json.contains(WALLET));
    }

    #[test]
    fn test_new_listing_parses_create_events_only() {
        let adapter = PumpPortalAdapter::from_config(&source(SourceKind::NewListing, vec![])).unwrap();

        let create = format!(
            r#"{{"signature":"sig1","mint":"{}","traderPublicKey":"{}","txType":"create","name":"Test","symbol":"TEST"}}"#,
            MINT, WALLET
        );
        let obs = adapter.parse_message(&create).unwrap();
        assert_eq!(obs.token.address, MINT);
        assert_eq!(obs.raw_ref, "sig1");

        let other = create.replace("create", "migrate");
        assert!(adapter.parse_message(&other).is_none());
        assert!(adapter.parse_message("{\"message\":\"subscribed\"}").is_none());
    }

    #[test]
    fn test_wallet_copy_only_tracked_buys() {
        let adapter =
            PumpPortalAdapter::from_config(&source(SourceKind::WalletCopy, vec![WALLET.into()]))
                .unwrap();

        let buy = format!(
            r#"{{"signature":"sig2","mint":"{}","traderPublicKey":"{}","txType":"buy","solAmount":500000000}}"#,
            MINT, WALLET
        );
        assert!(adapter.parse_message(&buy).is_some());
        assert!(adapter.parse_message(&buy.replace("\"buy\"", "\"sell\"")).is_none());
        assert!(adapter
            .parse_message(&buy.replace(WALLET, "11111111111111111111111111111111"))
            .is_none());
    }

    #[test]
    fn test_rejects_unsupported_kind() {
        assert!(PumpPortalAdapter::from_config(&source(SourceKind::Social, vec![])).is_err());
        assert!(PumpPortalAdapter::from_config(&source(SourceKind::WalletCopy, vec![])).is_err());
    }
}

//! Position monitor
//!
//! Polls prices for held positions on a fixed interval, evaluates exit
//! rules against fresh quotes only, and hands exit instructions to the
//! execution engine. Every instruction is persisted in the book before it
//! is dispatched, so a crash between decision and execution loses nothing.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ExitInstruction, ExitRules, Position, PositionBook, PriceQuote, PriceSource};
use crate::alert::{Alert, AlertSink};
use crate::config::MonitorConfig;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct FeedHealth {
    missed: u32,
    alerted: bool,
}

pub struct PositionMonitor {
    book: Arc<PositionBook>,
    prices: Arc<dyn PriceSource>,
    rules: ExitRules,
    alerts: AlertSink,
    exit_tx: mpsc::Sender<ExitInstruction>,
    poll_interval: Duration,
    price_timeout: Duration,
    staleness_bound: chrono::Duration,
    max_missed_polls: u32,
    feeds: HashMap<String, FeedHealth>,
}

impl PositionMonitor {
    pub fn new(
        config: &MonitorConfig,
        book: Arc<PositionBook>,
        prices: Arc<dyn PriceSource>,
        alerts: AlertSink,
        exit_tx: mpsc::Sender<ExitInstruction>,
    ) -> Self {
        Self {
            book,
            prices,
            rules: ExitRules::from(config),
            alerts,
            exit_tx,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            price_timeout: Duration::from_millis(config.price_timeout_ms),
            staleness_bound: chrono::Duration::seconds(config.staleness_bound_secs as i64),
            max_missed_polls: config.max_missed_polls.max(1),
            feeds: HashMap::new(),
        }
    }

    async fn dispatch(&self, instruction: ExitInstruction) {
        debug!(
            position_id = %instruction.position_id,
            reason = %instruction.reason,
            "Dispatching exit"
        );
        if self.exit_tx.send(instruction).await.is_err() {
            error!("Execution engine is gone; exit stays queued in the book");
        }
    }

    /// Re-dispatch every exit persisted before a restart
    pub async fn redispatch_pending(&self) -> Result<usize> {
        let pending = self.book.requeue_all_exits().await?;
        let count = pending.len();
        if count > 0 {
            info!("Re-dispatching {} pending exits from previous run", count);
        }
        for instruction in pending {
            self.dispatch(instruction).await;
        }
        Ok(count)
    }

    async fn poll(&self, position: &Position) -> Result<PriceQuote> {
        tokio::time::timeout(self.price_timeout, self.prices.quote(&position.token))
            .await
            .map_err(|_| Error::Timeout(self.price_timeout.as_millis() as u64))?
    }

    /// One monitoring pass over all held positions
    pub async fn tick(&mut self) -> Result<()> {
        for instruction in self.book.requeue_failed_exits().await? {
            info!(position_id = %instruction.position_id, "Retrying failed exit");
            self.dispatch(instruction).await;
        }

        let held: Vec<Position> = self
            .book
            .live_positions()
            .await
            .into_iter()
            .filter(|p| p.state.is_held())
            .collect();

        self.feeds
            .retain(|id, _| held.iter().any(|p| &p.id == id));

        let quotes = join_all(held.iter().map(|p| self.poll(p))).await;
        let now = Utc::now();

        for (mut position, quote) in held.into_iter().zip(quotes) {
            let fresh = match quote {
                Ok(q) if q.age(now) <= self.staleness_bound => Some(q),
                Ok(q) => {
                    debug!(
                        position_id = %position.id,
                        age_secs = q.age(now).num_seconds(),
                        "Stale quote ignored"
                    );
                    None
                }
                Err(e) => {
                    debug!(position_id = %position.id, "Price poll failed: {}", e);
                    None
                }
            };

            let Some(quote) = fresh else {
                self.record_miss(&position);
                continue;
            };

            if let Some(health) = self.feeds.get_mut(&position.id) {
                if health.alerted {
                    info!(position_id = %position.id, "Price feed recovered");
                }
                *health = FeedHealth::default();
            }

            if position.reference_liquidity_usd.is_none() {
                if let Some(liquidity) = quote.liquidity_usd {
                    self.book.set_reference_liquidity(&position.id, liquidity).await?;
                    position.reference_liquidity_usd = Some(liquidity);
                }
            }

            let Some(decision) = self.rules.evaluate(&position, &quote, now) else {
                continue;
            };

            let instruction = ExitInstruction::new(&position, decision);
            if let Some(instruction) = self.book.enqueue_exit(instruction).await? {
                info!(
                    position_id = %position.id,
                    token = %position.token,
                    reason = %instruction.reason,
                    "Exit triggered"
                );
                self.dispatch(instruction).await;
            }
        }

        Ok(())
    }

    fn record_miss(&mut self, position: &Position) {
        let health = self.feeds.entry(position.id.clone()).or_default();
        health.missed += 1;

        if health.missed >= self.max_missed_polls && !health.alerted {
            health.alerted = true;
            self.alerts.raise(Alert::StalePriceFeed {
                position_id: position.id.clone(),
                token: position.token.to_string(),
                missed_polls: health.missed,
            });
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        if let Err(e) = self.redispatch_pending().await {
            error!("Failed to re-dispatch pending exits: {}", e);
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Monitor tick failed: {}", e);
                    }
                }
            }
        }

        info!("Position monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Fill;
    use crate::position::{ExitReason, SellAmount};
    use crate::signal::TokenKey;
    use crate::store::JsonStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    /// Serves one configurable quote; `None` fails the poll
    struct StubPrices {
        quote: Mutex<Option<(f64, i64)>>,
    }

    impl StubPrices {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                quote: Mutex::new(None),
            })
        }

        /// Price and age in seconds
        fn set(&self, price: f64, age_secs: i64) {
            *self.quote.lock().unwrap() = Some((price, age_secs));
        }
    }

    #[async_trait]
    impl PriceSource for StubPrices {
        async fn quote(&self, token: &TokenKey) -> Result<PriceQuote> {
            let current = *self.quote.lock().unwrap();
            match current {
                Some((price, age)) => Ok(PriceQuote {
                    price,
                    liquidity_usd: Some(50_000.0),
                    observed_at: Utc::now() - chrono::Duration::seconds(age),
                }),
                None => Err(Error::PriceUnavailable(token.to_string())),
            }
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            staleness_bound_secs: 10,
            max_missed_polls: 3,
            ..MonitorConfig::default()
        }
    }

    async fn setup() -> (
        PositionMonitor,
        Arc<PositionBook>,
        Arc<StubPrices>,
        AlertSink,
        mpsc::Receiver<ExitInstruction>,
        String,
    ) {
        let book = Arc::new(PositionBook::open(JsonStore::memory()).await.unwrap());
        let token = TokenKey::parse("solana", MINT).unwrap();
        let p = Position::pending(token, 100_000_000, 0.8);
        let id = p.id.clone();
        book.insert_pending(p).await.unwrap();
        book.mark_open(
            &id,
            &Fill {
                signature: "buy".into(),
                token_amount: 1_000.0,
                lamports: 100_000_000,
                price: 0.0001,
            },
        )
        .await
        .unwrap();

        let prices = StubPrices::new();
        let alerts = AlertSink::new();
        let (tx, rx) = mpsc::channel(16);
        let monitor = PositionMonitor::new(&config(), book.clone(), prices.clone(), alerts.clone(), tx);
        (monitor, book, prices, alerts, rx, id)
    }

    #[tokio::test]
    async fn test_stale_feed_alerts_once_and_never_trades() {
        let (mut monitor, book, prices, alerts, mut rx, id) = setup().await;
        let mut alert_rx = alerts.subscribe();

        // Would be a stop loss, but the quote is a minute old
        prices.set(0.00006, 60);
        for _ in 0..5 {
            monitor.tick().await.unwrap();
        }

        assert!(rx.try_recv().is_err());
        assert!(book.pending_exit_for(&id).await.is_none());

        match alert_rx.try_recv().unwrap() {
            Alert::StalePriceFeed { position_id, missed_polls, .. } => {
                assert_eq!(position_id, id);
                assert_eq!(missed_polls, 3);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert!(alert_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_polls_count_as_misses() {
        let (mut monitor, _book, _prices, alerts, _rx, _id) = setup().await;
        let mut alert_rx = alerts.subscribe();

        monitor.tick().await.unwrap();
        monitor.tick().await.unwrap();
        assert!(alert_rx.try_recv().is_err());
        monitor.tick().await.unwrap();
        assert!(matches!(alert_rx.try_recv(), Ok(Alert::StalePriceFeed { .. })));
    }

    #[tokio::test]
    async fn test_stop_loss_dispatched_once() {
        let (mut monitor, book, prices, _alerts, mut rx, id) = setup().await;

        prices.set(0.00006, 0);
        monitor.tick().await.unwrap();

        let instruction = rx.try_recv().unwrap();
        assert_eq!(instruction.position_id, id);
        assert!(matches!(instruction.reason, ExitReason::StopLoss { .. }));
        assert_eq!(instruction.sell, SellAmount::All);
        assert!(book.pending_exit_for(&id).await.is_some());

        // Already pending: no second dispatch
        monitor.tick().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_take_profit_and_reference_liquidity() {
        let (mut monitor, book, prices, _alerts, mut rx, id) = setup().await;

        prices.set(0.00031, 0);
        monitor.tick().await.unwrap();

        let instruction = rx.try_recv().unwrap();
        assert_eq!(instruction.sell, SellAmount::Tokens(500.0));
        assert_eq!(
            book.get(&id).await.unwrap().reference_liquidity_usd,
            Some(50_000.0)
        );
    }

    #[tokio::test]
    async fn test_failed_exit_redispatched_next_tick() {
        let (mut monitor, book, prices, _alerts, mut rx, id) = setup().await;

        prices.set(0.00006, 0);
        monitor.tick().await.unwrap();
        let instruction = rx.try_recv().unwrap();

        book.begin_exit(&instruction.id).await.unwrap();
        book.fail_exit(&instruction.id, &id, "rpc down").await.unwrap();

        monitor.tick().await.unwrap();
        let retried = rx.try_recv().unwrap();
        assert_eq!(retried.id, instruction.id);
    }

    #[tokio::test]
    async fn test_redispatch_after_restart() {
        let (mut monitor, _book, prices, _alerts, mut rx, _id) = setup().await;

        prices.set(0.00006, 0);
        monitor.tick().await.unwrap();
        let first = rx.try_recv().unwrap();

        assert_eq!(monitor.redispatch_pending().await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().id, first.id);
    }
}

//! Exit rules: rug, stop loss, take-profit tiers, max hold
//!
//! Evaluated in that priority order; the first rule that fires wins.
//! Callers must only pass fresh quotes.

use chrono::{DateTime, Utc};

use super::{ExitReason, Position, PriceQuote, SellAmount};
use crate::config::{MonitorConfig, TakeProfitTier};

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub sell: SellAmount,
}

impl ExitDecision {
    fn all(reason: ExitReason) -> Self {
        Self {
            reason,
            sell: SellAmount::All,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitRules {
    stop_loss_pct: f64,
    take_profit_tiers: Vec<TakeProfitTier>,
    rug_price_collapse_pct: f64,
    rug_liquidity_drop_pct: f64,
    rug_min_liquidity_usd: f64,
    max_hold: Option<chrono::Duration>,
}

impl From<&MonitorConfig> for ExitRules {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            stop_loss_pct: config.stop_loss_pct,
            take_profit_tiers: config.take_profit_tiers.clone(),
            rug_price_collapse_pct: config.rug_price_collapse_pct,
            rug_liquidity_drop_pct: config.rug_liquidity_drop_pct,
            rug_min_liquidity_usd: config.rug_min_liquidity_usd,
            max_hold: config
                .max_hold_secs
                .map(|s| chrono::Duration::seconds(s as i64)),
        }
    }
}

impl ExitRules {
    pub fn evaluate(
        &self,
        position: &Position,
        quote: &PriceQuote,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        if !position.state.is_held() || position.remaining_token_amount <= 0.0 {
            return None;
        }

        if let Some(detail) = self.rug_detail(position, quote) {
            return Some(ExitDecision::all(ExitReason::Rug { detail }));
        }

        if position.entry_price > 0.0 {
            let change_pct = (quote.price - position.entry_price) / position.entry_price * 100.0;

            if change_pct <= -self.stop_loss_pct {
                return Some(ExitDecision::all(ExitReason::StopLoss { price: quote.price }));
            }

            if let Some(decision) = self.take_profit(position, quote.price) {
                return Some(decision);
            }
        }

        if let (Some(max_hold), Some(opened_at)) = (self.max_hold, position.opened_at) {
            if now - opened_at >= max_hold {
                return Some(ExitDecision::all(ExitReason::MaxHold));
            }
        }

        None
    }

    fn rug_detail(&self, position: &Position, quote: &PriceQuote) -> Option<String> {
        if let Some(liquidity) = quote.liquidity_usd {
            if liquidity < self.rug_min_liquidity_usd {
                return Some(format!(
                    "liquidity ${:.0} below ${:.0}",
                    liquidity, self.rug_min_liquidity_usd
                ));
            }

            if let Some(reference) = position.reference_liquidity_usd.filter(|r| *r > 0.0) {
                let drop_pct = (reference - liquidity) / reference * 100.0;
                if drop_pct >= self.rug_liquidity_drop_pct {
                    return Some(format!("liquidity down {:.1}%", drop_pct));
                }
            }
        }

        if position.entry_price > 0.0 {
            let drop_pct = (position.entry_price - quote.price) / position.entry_price * 100.0;
            if drop_pct >= self.rug_price_collapse_pct {
                return Some(format!("price down {:.1}%", drop_pct));
            }
        }

        None
    }

    /// All unhit tiers at or below the current multiple fire together
    fn take_profit(&self, position: &Position, price: f64) -> Option<ExitDecision> {
        let multiple = price / position.entry_price;

        let fired: Vec<usize> = self
            .take_profit_tiers
            .iter()
            .enumerate()
            .filter(|(i, tier)| !position.tiers_hit.contains(i) && multiple >= tier.multiple)
            .map(|(i, _)| i)
            .collect();

        if fired.is_empty() {
            return None;
        }

        let fraction: f64 = fired
            .iter()
            .map(|i| self.take_profit_tiers[*i].sell_fraction)
            .sum();
        let amount = (position.original_token_amount * fraction).min(position.remaining_token_amount);

        let sell = if position.sells_out(amount) {
            SellAmount::All
        } else {
            SellAmount::Tokens(amount)
        };

        Some(ExitDecision {
            reason: ExitReason::TakeProfit { tiers: fired, price },
            sell,
        })
    }
}

//! Trade execution: swap submission, retry, and the entry/exit engine

pub mod engine;
pub mod retry;
pub mod swap;

use serde::{Deserialize, Serialize};

use crate::config::LAMPORTS_PER_SOL;
use crate::signal::TokenKey;

pub use engine::ExecutionEngine;
pub use retry::{retry_with_backoff, Outcome, RetryPolicy};
pub use swap::{PaperExecutor, PumpPortalExecutor, SwapExecutor};

/// Confirmed result of one swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub signature: String,
    /// Whole tokens bought or sold
    pub token_amount: f64,
    /// Lamports spent (buy) or received (sell)
    pub lamports: u64,
    /// Effective SOL per token
    pub price: f64,
}

impl Fill {
    pub fn new(signature: String, token_amount: f64, lamports: u64) -> Self {
        let price = if token_amount > 0.0 {
            lamports as f64 / LAMPORTS_PER_SOL as f64 / token_amount
        } else {
            0.0
        };
        Self {
            signature,
            token_amount,
            lamports,
            price,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuyOrder {
    pub token: TokenKey,
    pub lamports: u64,
    pub slippage_bps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellOrder {
    pub token: TokenKey,
    pub token_amount: f64,
    /// Sell the whole balance regardless of `token_amount`
    pub sell_all: bool,
    pub slippage_bps: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_price() {
        let fill = Fill::new("sig".into(), 1_000.0, 100_000_000);
        assert!((fill.price - 0.0001).abs() < 1e-12);
        assert_eq!(Fill::new("sig".into(), 0.0, 5).price, 0.0);
    }
}

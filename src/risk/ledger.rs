//! Daily risk ledger
//!
//! Plain data plus the pure checks over it. Locking and persistence live in
//! `RiskManager`; nothing here does I/O.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::RiskRejection;
use crate::config::{sol_to_lamports, RiskConfig};

/// Days a settled position id is remembered after the day it was booked to
pub const SETTLED_RETENTION_DAYS: u64 = 7;

/// Risk limits in lamports
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub starting_equity: u64,
    pub daily_loss_limit: u64,
    pub max_concurrent_positions: usize,
    pub max_position_fraction: f64,
}

impl RiskLimits {
    pub fn from_config(config: &RiskConfig) -> Self {
        Self {
            starting_equity: sol_to_lamports(config.starting_equity_sol),
            daily_loss_limit: sol_to_lamports(config.daily_loss_limit_sol),
            max_concurrent_positions: config.max_concurrent_positions,
            max_position_fraction: config.max_position_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLedger {
    /// UTC day this ledger covers
    pub day: NaiveDate,
    pub day_start_equity: i64,
    pub realized_pnl_today: i64,
    pub open_position_count: usize,
    pub kill_switch_engaged: bool,
    #[serde(default)]
    pub kill_switch_reason: Option<String>,
    #[serde(default)]
    pub total_realized_pnl: i64,
    /// Positions whose P&L has been applied, with the UTC day it was
    /// booked to
    #[serde(default)]
    pub settled_positions: BTreeMap<String, NaiveDate>,
}

/// Realized P&L of a closed position, as recorded in the position book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedPnl {
    pub position_id: String,
    pub realized_pnl: i64,
    pub closed_on: NaiveDate,
}

impl RiskLedger {
    pub fn new(starting_equity: u64, day: NaiveDate) -> Self {
        Self {
            day,
            day_start_equity: starting_equity as i64,
            realized_pnl_today: 0,
            open_position_count: 0,
            kill_switch_engaged: false,
            kill_switch_reason: None,
            total_realized_pnl: 0,
            settled_positions: BTreeMap::new(),
        }
    }

    /// Tracked equity right now
    pub fn equity(&self) -> i64 {
        self.day_start_equity + self.realized_pnl_today
    }

    /// Largest position allowed at current equity
    pub fn position_cap(&self, limits: &RiskLimits) -> u64 {
        let equity = self.equity().max(0) as f64;
        (equity * limits.max_position_fraction).floor() as u64
    }

    /// Move to `today` if the day changed; returns true on rollover
    pub fn roll_to(&mut self, today: NaiveDate) -> bool {
        if today <= self.day {
            return false;
        }
        self.day_start_equity = self.equity();
        self.realized_pnl_today = 0;
        self.kill_switch_engaged = false;
        self.kill_switch_reason = None;
        self.day = today;

        let horizon = self.settled_horizon();
        self.settled_positions.retain(|_, booked| *booked >= horizon);
        true
    }

    /// Oldest day whose settled ids are still remembered
    pub fn settled_horizon(&self) -> NaiveDate {
        self.day
            .checked_sub_days(Days::new(SETTLED_RETENTION_DAYS))
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn is_settled(&self, position_id: &str) -> bool {
        self.settled_positions.contains_key(position_id)
    }

    /// Book a closed position's P&L to the day it closed on
    ///
    /// P&L from an earlier day is already part of today's starting equity,
    /// so it never counts against today's loss limit.
    pub fn book_closed(&mut self, position_id: &str, realized_pnl: i64, closed_on: NaiveDate) {
        if closed_on >= self.day {
            self.realized_pnl_today += realized_pnl;
        } else {
            self.day_start_equity += realized_pnl;
        }
        self.total_realized_pnl += realized_pnl;
        self.settled_positions
            .insert(position_id.to_string(), closed_on);
    }

    /// Has today's realized loss reached the limit
    pub fn loss_bound_reached(&self, limits: &RiskLimits) -> bool {
        self.realized_pnl_today <= -(limits.daily_loss_limit as i64)
    }

    /// Evaluate a proposed entry of `size` lamports
    pub fn check_entry(&self, size: u64, limits: &RiskLimits) -> Result<(), RiskRejection> {
        if self.kill_switch_engaged {
            return Err(RiskRejection::KillSwitchEngaged {
                reason: self
                    .kill_switch_reason
                    .clone()
                    .unwrap_or_else(|| "unspecified".into()),
            });
        }

        if size == 0 {
            return Err(RiskRejection::InvalidSize);
        }

        if self.open_position_count >= limits.max_concurrent_positions {
            return Err(RiskRejection::MaxConcurrentPositions {
                open: self.open_position_count,
                max: limits.max_concurrent_positions,
            });
        }

        let cap = self.position_cap(limits);
        if size > cap {
            return Err(RiskRejection::PositionTooLarge {
                requested: size,
                max: cap,
            });
        }

        // Worst case the whole position is lost
        let worst_case = self.realized_pnl_today.saturating_sub(size as i64);
        if worst_case <= -(limits.daily_loss_limit as i64) {
            return Err(RiskRejection::DailyLossLimit {
                realized_pnl_today: self.realized_pnl_today,
                size,
                limit: limits.daily_loss_limit,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOL: u64 = 1_000_000_000;

    fn limits() -> RiskLimits {
        RiskLimits {
            starting_equity: 10 * SOL,
            daily_loss_limit: SOL,
            max_concurrent_positions: 2,
            max_position_fraction: 0.1,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_check_entry_order() {
        let mut ledger = RiskLedger::new(10 * SOL, day(1));
        assert!(ledger.check_entry(SOL / 10, &limits()).is_ok());

        // 10% of 10 SOL
        assert!(matches!(
            ledger.check_entry(SOL + 1, &limits()),
            Err(RiskRejection::PositionTooLarge { max, .. }) if max == SOL
        ));

        ledger.open_position_count = 2;
        assert!(matches!(
            ledger.check_entry(SOL / 10, &limits()),
            Err(RiskRejection::MaxConcurrentPositions { open: 2, max: 2 })
        ));

        ledger.kill_switch_engaged = true;
        ledger.kill_switch_reason = Some("manual".into());
        assert_eq!(
            ledger.check_entry(SOL / 10, &limits()),
            Err(RiskRejection::KillSwitchEngaged {
                reason: "manual".into()
            })
        );
    }

    #[test]
    fn test_daily_loss_worst_case() {
        let mut ledger = RiskLedger::new(10 * SOL, day(1));
        ledger.realized_pnl_today = -(SOL as i64) * 9 / 10;

        // -0.9 - 0.1 reaches -1.0
        assert!(matches!(
            ledger.check_entry(SOL / 10, &limits()),
            Err(RiskRejection::DailyLossLimit { .. })
        ));
        assert!(ledger.check_entry(SOL / 20, &limits()).is_ok());
    }

    #[test]
    fn test_rollover_resets_day_but_keeps_open_count() {
        let mut ledger = RiskLedger::new(10 * SOL, day(1));
        ledger.realized_pnl_today = -(SOL as i64);
        ledger.open_position_count = 1;
        ledger.kill_switch_engaged = true;
        ledger.settled_positions.insert("p1".into(), day(1));

        assert!(!ledger.roll_to(day(1)));
        assert!(ledger.roll_to(day(2)));

        assert_eq!(ledger.day_start_equity, 9 * SOL as i64);
        assert_eq!(ledger.realized_pnl_today, 0);
        assert_eq!(ledger.open_position_count, 1);
        assert!(!ledger.kill_switch_engaged);
        assert!(ledger.is_settled("p1"));
    }

    #[test]
    fn test_rollover_forgets_settled_ids_past_retention() {
        let mut ledger = RiskLedger::new(10 * SOL, day(1));
        ledger.book_closed("old", 0, day(1));
        ledger.roll_to(day(5));
        ledger.book_closed("recent", 0, day(5));

        ledger.roll_to(day(8));
        assert!(ledger.is_settled("old"));
        assert_eq!(ledger.settled_horizon(), day(1));

        ledger.roll_to(day(9));
        assert!(!ledger.is_settled("old"));
        assert!(ledger.is_settled("recent"));
    }

    #[test]
    fn test_book_closed_from_earlier_day_goes_to_starting_equity() {
        let mut ledger = RiskLedger::new(10 * SOL, day(2));
        ledger.book_closed("yesterday", -(SOL as i64), day(1));
        ledger.book_closed("today", -(SOL as i64) / 2, day(2));

        assert_eq!(ledger.day_start_equity, 9 * SOL as i64);
        assert_eq!(ledger.realized_pnl_today, -(SOL as i64) / 2);
        assert_eq!(ledger.total_realized_pnl, -(SOL as i64) * 3 / 2);
        assert!(!ledger.loss_bound_reached(&limits()));
    }

    #[test]
    fn test_cap_follows_equity() {
        let mut ledger = RiskLedger::new(10 * SOL, day(1));
        ledger.realized_pnl_today = 10 * SOL as i64;
        assert_eq!(ledger.position_cap(&limits()), 2 * SOL);

        ledger.realized_pnl_today = -20 * SOL as i64;
        assert_eq!(ledger.position_cap(&limits()), 0);
    }
}

//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::aggregator::scoring::ScoreFormula;
pub use crate::signal::SourceKind;
pub use crate::validator::CheckKind;

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Total basis points (100%)
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Convert SOL to lamports, saturating at zero for negative input
pub fn sol_to_lamports(sol: f64) -> u64 {
    if sol <= 0.0 {
        return 0;
    }
    (sol * LAMPORTS_PER_SOL as f64).round() as u64
}

/// Convert lamports to SOL (display only)
pub fn lamports_to_sol(lamports: i64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub adapter_backoff: AdapterBackoffConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One upstream signal feed
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Unique source id (used for dedupe and weighting)
    pub id: String,
    pub kind: SourceKind,
    /// Static quality weight reflecting historical reliability
    #[serde(default = "default_source_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Feed endpoint (WebSocket or HTTP base URL depending on kind)
    #[serde(default)]
    pub url: Option<String>,
    /// Wallets to copy (wallet_copy sources only)
    #[serde(default)]
    pub tracked_wallets: Vec<String>,
    #[serde(default = "default_source_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

/// Reconnect policy shared by every source adapter
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterBackoffConfig {
    #[serde(default = "default_adapter_initial_secs")]
    pub initial_secs: u64,
    #[serde(default = "default_adapter_max_secs")]
    pub max_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Consecutive failed sessions before the adapter is reported degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,
}

impl Default for AdapterBackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_adapter_initial_secs(),
            max_secs: default_adapter_max_secs(),
            multiplier: default_multiplier(),
            degraded_after_failures: default_degraded_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_emit_threshold")]
    pub emit_threshold: f64,
    #[serde(default)]
    pub formula: ScoreFormula,
    /// Per-source weight overrides, keyed by source id
    #[serde(default)]
    pub source_weights: HashMap<String, f64>,
    /// How long after a window ends late signals are still accepted
    #[serde(default = "default_lateness_secs")]
    pub lateness_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            emit_threshold: default_emit_threshold(),
            formula: ScoreFormula::default(),
            source_weights: HashMap::new(),
            lateness_secs: default_lateness_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl AggregatorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// One external safety oracle
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub check: CheckKind,
    /// Service name; checks sharing a service share its rate limit
    pub service: String,
    pub base_url: String,
    #[serde(default = "default_oracle_concurrency")]
    pub max_concurrent: usize,
    #[serde(default = "default_oracle_min_interval_ms")]
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub oracles: Vec<OracleConfig>,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    #[serde(default = "default_validator_workers")]
    pub workers: usize,
    #[serde(default = "default_validator_queue")]
    pub queue_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            oracles: Vec::new(),
            check_timeout_ms: default_check_timeout_ms(),
            workers: default_validator_workers(),
            queue_capacity: default_validator_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Equity tracked on the very first ledger day
    #[serde(default = "default_starting_equity")]
    pub starting_equity_sol: f64,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit_sol: f64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    /// Per-position cap as a fraction of tracked equity
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: f64,
    #[serde(default = "default_base_size")]
    pub base_size_sol: f64,
    #[serde(default = "default_min_size")]
    pub min_size_sol: f64,
    #[serde(default = "default_max_size")]
    pub max_size_sol: f64,
    #[serde(default = "default_true")]
    pub score_scaling: bool,
    #[serde(default = "default_max_score_multiplier")]
    pub max_score_multiplier: f64,
    #[serde(default = "default_housekeeping_secs")]
    pub housekeeping_interval_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_equity_sol: default_starting_equity(),
            daily_loss_limit_sol: default_daily_loss_limit(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_position_fraction: default_max_position_fraction(),
            base_size_sol: default_base_size(),
            min_size_sol: default_min_size(),
            max_size_sol: default_max_size(),
            score_scaling: true,
            max_score_multiplier: default_max_score_multiplier(),
            housekeeping_interval_secs: default_housekeeping_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_trade_api_url")]
    pub trade_api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Slippage tolerance for rug exits (best effort, effectively unbounded)
    #[serde(default = "default_rug_slippage_bps")]
    pub rug_slippage_bps: u32,
    #[serde(default = "default_priority_fee")]
    pub priority_fee_sol: f64,
    /// Simulated slippage for paper fills
    #[serde(default = "default_paper_slippage_bps")]
    pub paper_slippage_bps: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            trade_api_url: default_trade_api_url(),
            api_key: String::new(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            slippage_bps: default_slippage_bps(),
            rug_slippage_bps: default_rug_slippage_bps(),
            priority_fee_sol: default_priority_fee(),
            paper_slippage_bps: default_paper_slippage_bps(),
        }
    }
}

/// Partial exit at a price multiple of entry
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TakeProfitTier {
    /// Price multiple of entry (3.0 = 3x)
    pub multiple: f64,
    /// Fraction of the ORIGINAL position size to sell
    pub sell_fraction: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_price_timeout_ms")]
    pub price_timeout_ms: u64,
    #[serde(default = "default_price_api_url")]
    pub price_api_url: String,
    /// Quotes older than this are never traded on
    #[serde(default = "default_staleness_bound_secs")]
    pub staleness_bound_secs: u64,
    /// Consecutive missed/stale polls tolerated before alerting
    #[serde(default = "default_max_missed_polls")]
    pub max_missed_polls: u32,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_tiers")]
    pub take_profit_tiers: Vec<TakeProfitTier>,
    /// Price drop from entry treated as a rug
    #[serde(default = "default_rug_price_collapse_pct")]
    pub rug_price_collapse_pct: f64,
    /// Liquidity drop from the reference level treated as a rug
    #[serde(default = "default_rug_liquidity_drop_pct")]
    pub rug_liquidity_drop_pct: f64,
    #[serde(default = "default_rug_min_liquidity")]
    pub rug_min_liquidity_usd: f64,
    #[serde(default)]
    pub max_hold_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            price_timeout_ms: default_price_timeout_ms(),
            price_api_url: default_price_api_url(),
            staleness_bound_secs: default_staleness_bound_secs(),
            max_missed_polls: default_max_missed_polls(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_tiers: default_take_profit_tiers(),
            rug_price_collapse_pct: default_rug_price_collapse_pct(),
            rug_liquidity_drop_pct: default_rug_liquidity_drop_pct(),
            rug_min_liquidity_usd: default_rug_min_liquidity(),
            max_hold_secs: None,
        }
    }
}

/// Profit split in basis points; must sum to 10 000
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_compound_bps")]
    pub compound_bps: u64,
    #[serde(default = "default_buyback_bps")]
    pub buyback_bps: u64,
    #[serde(default = "default_burn_bps")]
    pub burn_bps: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            compound_bps: default_compound_bps(),
            buyback_bps: default_buyback_bps(),
            burn_bps: default_burn_bps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for durable state; unset = memory only
    #[serde(default = "default_state_dir")]
    pub state_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of a state document, if persistence is enabled
    pub fn file(&self, name: &str) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| Path::new(dir).join(name))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_source_weight() -> f64 {
    0.5
}

fn default_source_poll_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_adapter_initial_secs() -> u64 {
    10
}

fn default_adapter_max_secs() -> u64 {
    300
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_degraded_after() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    120
}

fn default_emit_threshold() -> f64 {
    0.7
}

fn default_lateness_secs() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_oracle_concurrency() -> usize {
    2
}

fn default_oracle_min_interval_ms() -> u64 {
    250
}

fn default_check_timeout_ms() -> u64 {
    3000
}

fn default_validator_workers() -> usize {
    4
}

fn default_validator_queue() -> usize {
    256
}

fn default_starting_equity() -> f64 {
    10.0
}

fn default_daily_loss_limit() -> f64 {
    1.0
}

fn default_max_concurrent_positions() -> usize {
    5
}

fn default_max_position_fraction() -> f64 {
    0.1
}

fn default_base_size() -> f64 {
    0.1
}

fn default_min_size() -> f64 {
    0.01
}

fn default_max_size() -> f64 {
    0.5
}

fn default_max_score_multiplier() -> f64 {
    2.0
}

fn default_housekeeping_secs() -> u64 {
    30
}

fn default_trade_api_url() -> String {
    std::env::var("TRADE_API_URL").unwrap_or_else(|_| "https://pumpportal.fun/api/trade".into())
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    4000
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_slippage_bps() -> u32 {
    1500
}

fn default_rug_slippage_bps() -> u32 {
    9900
}

fn default_priority_fee() -> f64 {
    0.0005
}

fn default_paper_slippage_bps() -> u32 {
    100
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_price_timeout_ms() -> u64 {
    3000
}

fn default_price_api_url() -> String {
    "https://api.dexscreener.com".into()
}

fn default_staleness_bound_secs() -> u64 {
    30
}

fn default_max_missed_polls() -> u32 {
    3
}

fn default_stop_loss_pct() -> f64 {
    30.0
}

fn default_take_profit_tiers() -> Vec<TakeProfitTier> {
    vec![
        TakeProfitTier {
            multiple: 3.0,
            sell_fraction: 0.5,
        },
        TakeProfitTier {
            multiple: 10.0,
            sell_fraction: 0.3,
        },
    ]
}

fn default_rug_price_collapse_pct() -> f64 {
    80.0
}

fn default_rug_liquidity_drop_pct() -> f64 {
    70.0
}

fn default_rug_min_liquidity() -> f64 {
    1000.0
}

fn default_compound_bps() -> u64 {
    5000
}

fn default_buyback_bps() -> u64 {
    3000
}

fn default_burn_bps() -> u64 {
    2000
}

fn default_state_dir() -> Option<String> {
    Some("state".into())
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix CONFLUENCE_)
            .add_source(
                config::Environment::with_prefix("CONFLUENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate sources
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                anyhow::bail!("Duplicate source id: {}", source.id);
            }
            if !(source.weight > 0.0 && source.weight <= 1.0) {
                anyhow::bail!("Source {} weight must be in (0, 1]", source.id);
            }
            if source.poll_interval_secs == 0 || source.ping_interval_secs == 0 {
                anyhow::bail!("Source {} intervals must be positive", source.id);
            }
            for wallet in &source.tracked_wallets {
                if crate::signal::TokenKey::parse("solana", wallet).is_err() {
                    anyhow::bail!("Invalid tracked wallet address: {}", wallet);
                }
            }
        }

        // Validate adapter reconnect policy
        let b = &self.adapter_backoff;
        if b.initial_secs == 0 || b.max_secs < b.initial_secs {
            anyhow::bail!("adapter_backoff must satisfy 0 < initial_secs <= max_secs");
        }
        if b.multiplier < 1.0 {
            anyhow::bail!("adapter_backoff.multiplier must be at least 1");
        }
        if b.degraded_after_failures == 0 {
            anyhow::bail!("adapter_backoff.degraded_after_failures must be at least 1");
        }

        // Validate aggregation window
        if self.aggregator.window_secs == 0 {
            anyhow::bail!("aggregator.window_secs must be positive");
        }
        if self.aggregator.emit_threshold <= 0.0 {
            anyhow::bail!("aggregator.emit_threshold must be positive");
        }

        // Validate validator pool
        if self.validator.workers == 0 || self.validator.queue_capacity == 0 {
            anyhow::bail!("validator.workers and validator.queue_capacity must be positive");
        }
        if self.validator.check_timeout_ms == 0 {
            anyhow::bail!("validator.check_timeout_ms must be positive");
        }
        for oracle in &self.validator.oracles {
            if oracle.max_concurrent == 0 {
                anyhow::bail!("Oracle {} max_concurrent must be positive", oracle.service);
            }
        }

        // Validate risk limits
        if self.risk.daily_loss_limit_sol <= 0.0 {
            anyhow::bail!("daily_loss_limit_sol must be positive");
        }
        if self.risk.starting_equity_sol <= 0.0 {
            anyhow::bail!("starting_equity_sol must be positive");
        }
        if self.risk.max_concurrent_positions == 0 {
            anyhow::bail!("max_concurrent_positions must be positive");
        }
        if !(self.risk.max_position_fraction > 0.0 && self.risk.max_position_fraction <= 1.0) {
            anyhow::bail!("max_position_fraction must be in (0, 1]");
        }
        if self.risk.min_size_sol <= 0.0 || self.risk.min_size_sol > self.risk.max_size_sol {
            anyhow::bail!("risk sizes must satisfy 0 < min_size_sol <= max_size_sol");
        }
        if self.risk.housekeeping_interval_secs == 0 {
            anyhow::bail!("risk.housekeeping_interval_secs must be positive");
        }

        // Validate execution
        if self.execution.max_attempts == 0 {
            anyhow::bail!("execution.max_attempts must be at least 1");
        }
        if self.execution.attempt_timeout_ms == 0 {
            anyhow::bail!("execution.attempt_timeout_ms must be positive");
        }
        if self.execution.initial_backoff_ms == 0
            || self.execution.max_backoff_ms < self.execution.initial_backoff_ms
        {
            anyhow::bail!("execution backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms");
        }
        if self.execution.slippage_bps > 10_000 || self.execution.rug_slippage_bps > 10_000 {
            anyhow::bail!("slippage_bps cannot exceed 10000 (100%)");
        }

        // Validate exit rules
        if self.monitor.poll_interval_ms == 0 {
            anyhow::bail!("monitor.poll_interval_ms must be positive");
        }
        if self.monitor.price_timeout_ms == 0 {
            anyhow::bail!("monitor.price_timeout_ms must be positive");
        }
        if self.monitor.staleness_bound_secs == 0 {
            anyhow::bail!("monitor.staleness_bound_secs must be positive");
        }
        if self.monitor.stop_loss_pct <= 0.0 || self.monitor.stop_loss_pct >= 100.0 {
            anyhow::bail!("stop_loss_pct must be between 0 and 100");
        }
        let mut last_multiple = 1.0;
        let mut total_fraction = 0.0;
        for tier in &self.monitor.take_profit_tiers {
            if tier.multiple <= last_multiple {
                anyhow::bail!("take_profit_tiers multiples must be > 1 and strictly increasing");
            }
            if tier.sell_fraction <= 0.0 {
                anyhow::bail!("take_profit_tiers sell_fraction must be positive");
            }
            last_multiple = tier.multiple;
            total_fraction += tier.sell_fraction;
        }
        if total_fraction > 1.0 + f64::EPSILON {
            anyhow::bail!("take_profit_tiers sell fractions exceed 100% of the position");
        }

        // Validate allocation ratios
        let a = &self.allocation;
        if a.compound_bps + a.buyback_bps + a.burn_bps != BPS_DENOMINATOR {
            anyhow::bail!(
                "allocation ratios must sum to {} bps, got {}",
                BPS_DENOMINATOR,
                a.compound_bps + a.buyback_bps + a.burn_bps
            );
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let sources: Vec<String> = self
            .sources
            .iter()
            .map(|s| {
                format!(
                    "{} ({:?}, weight {}, {})",
                    s.id,
                    s.kind,
                    s.weight,
                    s.url.as_deref().map(mask_url).unwrap_or_else(|| "default".into())
                )
            })
            .collect();

        format!(
            r#"Configuration:
  Sources: {:?}
  Aggregator:
    window: {}s
    emit_threshold: {}
    formula: {:?}
  Validator:
    oracles: {}
    check_timeout: {}ms
    workers: {}
  Risk:
    daily_loss_limit: {} SOL
    max_concurrent_positions: {}
    max_position_fraction: {}
    base_size: {} SOL
  Execution:
    trade_api: {}
    api_key: {}
    max_attempts: {}
    slippage: {}bps
  Monitor:
    poll_interval: {}ms
    staleness_bound: {}s
    stop_loss: {}%
    take_profit_tiers: {:?}
  Allocation:
    compound/buyback/burn: {}/{}/{} bps
  Storage:
    state_dir: {}
"#,
            sources,
            self.aggregator.window_secs,
            self.aggregator.emit_threshold,
            self.aggregator.formula,
            self.validator.oracles.len(),
            self.validator.check_timeout_ms,
            self.validator.workers,
            self.risk.daily_loss_limit_sol,
            self.risk.max_concurrent_positions,
            self.risk.max_position_fraction,
            self.risk.base_size_sol,
            mask_url(&self.execution.trade_api_url),
            if self.execution.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.execution.max_attempts,
            self.execution.slippage_bps,
            self.monitor.poll_interval_ms,
            self.monitor.staleness_bound_secs,
            self.monitor.stop_loss_pct,
            self.monitor
                .take_profit_tiers
                .iter()
                .map(|t| (t.multiple, t.sell_fraction))
                .collect::<Vec<_>>(),
            self.allocation.compound_bps,
            self.allocation.buyback_bps,
            self.allocation.burn_bps,
            self.storage.state_dir.as_deref().unwrap_or("(memory only)"),
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            adapter_backoff: AdapterBackoffConfig::default(),
            aggregator: AggregatorConfig::default(),
            validator: ValidatorConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            monitor: MonitorConfig::default(),
            allocation: AllocationConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregator.window_secs, 120);
        assert_eq!(config.risk.max_concurrent_positions, 5);
        assert_eq!(config.monitor.take_profit_tiers.len(), 2);
    }

    #[test]
    fn test_allocation_must_sum_to_whole() {
        let mut config = Config::default();
        config.allocation.burn_bps = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_and_intervals_rejected() {
        let cases: Vec<fn(&mut Config)> = vec![
            |c| c.execution.attempt_timeout_ms = 0,
            |c| c.execution.initial_backoff_ms = 0,
            |c| c.monitor.price_timeout_ms = 0,
            |c| c.monitor.staleness_bound_secs = 0,
            |c| c.validator.check_timeout_ms = 0,
            |c| c.adapter_backoff.initial_secs = 0,
            |c| c.adapter_backoff.max_secs = 0,
            |c| c.adapter_backoff.degraded_after_failures = 0,
            |c| c.risk.housekeeping_interval_secs = 0,
        ];

        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {} accepted", i);
        }
    }

    #[test]
    fn test_tiers_must_increase() {
        let mut config = Config::default();
        config.monitor.take_profit_tiers = vec![
            TakeProfitTier {
                multiple: 10.0,
                sell_fraction: 0.3,
            },
            TakeProfitTier {
                multiple: 3.0,
                sell_fraction: 0.5,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confluence.toml");
        std::fs::write(
            &path,
            r#"
[aggregator]
window_secs = 60
emit_threshold = 0.9

[[sources]]
id = "listings"
kind = "new_listing"
weight = 0.4

[risk]
max_concurrent_positions = 2
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.aggregator.window_secs, 60);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].kind, SourceKind::NewListing);
        assert_eq!(config.risk.max_concurrent_positions, 2);
    }

    #[test]
    fn test_sol_lamports_conversion() {
        assert_eq!(sol_to_lamports(0.1), 100_000_000);
        assert_eq!(sol_to_lamports(-1.0), 0);
        assert!((lamports_to_sol(-500_000_000) + 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(mask_url("https://api.example.com"), "https://api.example.com");
    }
}

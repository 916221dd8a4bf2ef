//! Pre-trade safety validation
//!
//! Every candidate runs four independent checks against external oracles.
//! The validator fails closed: a check that fails, times out, errors or has
//! no oracle configured makes the whole verdict fail. Only a passed verdict
//! can produce a `ValidatedCandidate`, which is the only thing the risk
//! manager accepts.

pub mod oracle;
pub mod rate_limit;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::Candidate;
use crate::config::ValidatorConfig;
use crate::error::Result;
use crate::signal::TokenKey;
pub use oracle::{HttpSafetyOracle, OracleAnswer, SafetyOracle};
pub use rate_limit::ServiceLimiter;

/// The independent safety checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Token can actually be sold
    Honeypot,
    /// Liquidity is locked or burned
    LiquidityLock,
    /// No wallet (or cluster) holds an outsized share of supply
    HolderConcentration,
    /// No dangerous mint/freeze authorities or transfer hooks
    ContractFlags,
}

impl CheckKind {
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Honeypot,
        CheckKind::LiquidityLock,
        CheckKind::HolderConcentration,
        CheckKind::ContractFlags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Honeypot => "honeypot",
            CheckKind::LiquidityLock => "liquidity_lock",
            CheckKind::HolderConcentration => "holder_concentration",
            CheckKind::ContractFlags => "contract_flags",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed(String),
    /// Oracle unreachable, malformed or missing
    Unknown(String),
    TimedOut { after_ms: u64 },
}

impl CheckOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub outcome: CheckOutcome,
}

impl CheckResult {
    fn reason(&self) -> Option<String> {
        match &self.outcome {
            CheckOutcome::Passed => None,
            CheckOutcome::Failed(r) => Some(format!("{}: {}", self.check, r)),
            CheckOutcome::Unknown(r) => Some(format!("{}: unknown ({})", self.check, r)),
            CheckOutcome::TimedOut { after_ms } => {
                Some(format!("{}: timeout after {}ms", self.check, after_ms))
            }
        }
    }
}

/// Aggregate safety verdict for one candidate
///
/// Only the validator builds verdicts; `passed` is true exactly when every
/// check passed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyVerdict {
    token: TokenKey,
    passed: bool,
    reasons: Vec<String>,
    checks: Vec<CheckResult>,
    checked_at: DateTime<Utc>,
}

impl SafetyVerdict {
    fn from_checks(token: TokenKey, checks: Vec<CheckResult>) -> Self {
        let reasons: Vec<String> = checks.iter().filter_map(CheckResult::reason).collect();
        Self {
            token,
            passed: checks.len() == CheckKind::ALL.len() && reasons.is_empty(),
            reasons,
            checks,
            checked_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &TokenKey {
        &self.token
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn checks(&self) -> &[CheckResult] {
        &self.checks
    }

    pub fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }
}

/// A candidate that passed every safety check
#[derive(Debug, Clone)]
pub struct ValidatedCandidate {
    candidate: Candidate,
    verdict: SafetyVerdict,
}

impl ValidatedCandidate {
    /// Pair a candidate with its verdict; fails unless the verdict passed
    /// for this very token
    pub fn new(candidate: Candidate, verdict: SafetyVerdict) -> std::result::Result<Self, SafetyVerdict> {
        if !verdict.passed || verdict.token != candidate.token {
            return Err(verdict);
        }
        Ok(Self { candidate, verdict })
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn verdict(&self) -> &SafetyVerdict {
        &self.verdict
    }

    pub fn token(&self) -> &TokenKey {
        &self.candidate.token
    }

    pub fn score(&self) -> f64 {
        self.candidate.confluence_score
    }

    /// Skip the oracles; for tests of downstream stages
    #[cfg(test)]
    pub(crate) fn assume_safe(candidate: Candidate) -> Self {
        let checks = CheckKind::ALL
            .iter()
            .map(|&check| CheckResult {
                check,
                outcome: CheckOutcome::Passed,
            })
            .collect();
        let verdict = SafetyVerdict::from_checks(candidate.token.clone(), checks);
        Self { candidate, verdict }
    }
}

struct OracleHandle {
    oracle: Arc<dyn SafetyOracle>,
    limiter: Arc<ServiceLimiter>,
}

/// Runs the safety checks for candidates
pub struct Validator {
    oracles: HashMap<CheckKind, OracleHandle>,
    check_timeout: Duration,
}

impl Validator {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            oracles: HashMap::new(),
            check_timeout,
        }
    }

    /// Register the oracle answering `check`
    pub fn with_oracle(
        mut self,
        check: CheckKind,
        oracle: Arc<dyn SafetyOracle>,
        limiter: Arc<ServiceLimiter>,
    ) -> Self {
        self.oracles.insert(check, OracleHandle { oracle, limiter });
        self
    }

    /// Build HTTP oracles from config; checks on one service share a limiter
    pub fn from_config(config: &ValidatorConfig) -> Result<Self> {
        let check_timeout = Duration::from_millis(config.check_timeout_ms);
        let mut limiters: HashMap<String, Arc<ServiceLimiter>> = HashMap::new();
        let mut validator = Self::new(check_timeout);

        for oc in &config.oracles {
            let limiter = limiters
                .entry(oc.service.clone())
                .or_insert_with(|| {
                    Arc::new(ServiceLimiter::new(
                        &oc.service,
                        oc.max_concurrent,
                        Duration::from_millis(oc.min_interval_ms),
                    ))
                })
                .clone();
            // The validator's own timeout is authoritative; the client one is a backstop
            let oracle = HttpSafetyOracle::new(&oc.service, &oc.base_url, check_timeout * 2)?;
            validator = validator.with_oracle(oc.check, Arc::new(oracle), limiter);
        }

        for check in CheckKind::ALL {
            if !validator.oracles.contains_key(&check) {
                warn!(%check, "No oracle configured, every candidate will fail this check");
            }
        }

        Ok(validator)
    }

    async fn run_check(&self, check: CheckKind, token: &TokenKey) -> CheckResult {
        let Some(handle) = self.oracles.get(&check) else {
            return CheckResult {
                check,
                outcome: CheckOutcome::Unknown("no oracle configured".into()),
            };
        };

        let _permit = match handle.limiter.acquire().await {
            Ok(p) => p,
            Err(e) => {
                return CheckResult {
                    check,
                    outcome: CheckOutcome::Unknown(e.to_string()),
                }
            }
        };

        // Timeout covers the oracle call only, not the queueing above
        let outcome =
            match tokio::time::timeout(self.check_timeout, handle.oracle.check(check, token)).await {
                Ok(Ok(answer)) if answer.passed => CheckOutcome::Passed,
                Ok(Ok(answer)) => CheckOutcome::Failed(
                    answer.reason.unwrap_or_else(|| "rejected by oracle".into()),
                ),
                Ok(Err(e)) => CheckOutcome::Unknown(e.to_string()),
                Err(_) => {
                    warn!(service = handle.oracle.service(), %check, token = %token, "Safety check timed out");
                    CheckOutcome::TimedOut {
                        after_ms: self.check_timeout.as_millis() as u64,
                    }
                }
            };

        CheckResult { check, outcome }
    }

    /// Run all checks concurrently and build the verdict
    pub async fn check(&self, token: &TokenKey) -> SafetyVerdict {
        let checks = join_all(CheckKind::ALL.iter().map(|&c| self.run_check(c, token))).await;
        SafetyVerdict::from_checks(token.clone(), checks)
    }

    /// Validate one candidate
    pub async fn validate(
        &self,
        candidate: Candidate,
    ) -> std::result::Result<ValidatedCandidate, SafetyVerdict> {
        let verdict = self.check(&candidate.token).await;
        if verdict.passed {
            info!(token = %candidate.token, score = candidate.confluence_score, "Candidate passed safety checks");
        } else {
            info!(token = %candidate.token, reasons = ?verdict.reasons, "Candidate rejected");
        }
        ValidatedCandidate::new(candidate, verdict)
    }

    /// Start `workers` tasks draining the candidate queue
    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: usize,
        candidates: async_channel::Receiver<Candidate>,
        validated: async_channel::Sender<ValidatedCandidate>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let validator = Arc::clone(self);
                let candidates = candidates.clone();
                let validated = validated.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    debug!(worker, "Validator worker started");
                    loop {
                        let candidate = tokio::select! {
                            c = candidates.recv() => match c {
                                Ok(c) => c,
                                Err(_) => break,
                            },
                            _ = shutdown.cancelled() => break,
                        };

                        if let Ok(v) = validator.validate(candidate).await {
                            if validated.send(v).await.is_err() {
                                break;
                            }
                        }
                    }
                    debug!(worker, "Validator worker stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    enum Behaviour {
        Pass,
        Fail(&'static str),
        Hang,
        Error,
    }

    struct StubOracle {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl StubOracle {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SafetyOracle for StubOracle {
        fn service(&self) -> &str {
            "stub"
        }

        async fn check(&self, _check: CheckKind, _token: &TokenKey) -> Result<OracleAnswer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Pass => Ok(OracleAnswer::pass()),
                Behaviour::Fail(r) => Ok(OracleAnswer::fail(r)),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(OracleAnswer::pass())
                }
                Behaviour::Error => Err(Error::Oracle {
                    service: "stub".into(),
                    reason: "HTTP 502".into(),
                }),
            }
        }
    }

    fn limiter() -> Arc<ServiceLimiter> {
        Arc::new(ServiceLimiter::new("stub", 8, Duration::ZERO))
    }

    fn token() -> TokenKey {
        TokenKey::parse("solana", MINT).unwrap()
    }

    fn candidate() -> Candidate {
        let now = Utc::now();
        Candidate {
            token: token(),
            confluence_score: 0.8,
            contributing_sources: BTreeSet::from(["a".to_string(), "b".to_string()]),
            first_seen_at: now,
            window_closed_at: now,
            crossed_at: now,
        }
    }

    fn validator_with(overrides: Vec<(CheckKind, Arc<StubOracle>)>) -> Validator {
        let mut v = Validator::new(Duration::from_millis(3000));
        for check in CheckKind::ALL {
            v = v.with_oracle(check, StubOracle::new(Behaviour::Pass), limiter());
        }
        for (check, oracle) in overrides {
            v = v.with_oracle(check, oracle, limiter());
        }
        v
    }

    #[tokio::test]
    async fn test_all_pass() {
        let v = validator_with(vec![]);
        let validated = v.validate(candidate()).await.unwrap();
        assert!(validated.verdict().passed());
        assert_eq!(validated.verdict().checks().len(), 4);
        assert_eq!(validated.score(), 0.8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidity_lock_timeout_fails_closed() {
        let v = validator_with(vec![(CheckKind::LiquidityLock, StubOracle::new(Behaviour::Hang))]);

        let verdict = v.validate(candidate()).await.unwrap_err();
        assert!(!verdict.passed());
        assert_eq!(verdict.reasons().len(), 1);
        assert!(verdict.reasons()[0].contains("liquidity_lock"));
        assert!(verdict.reasons()[0].contains("timeout"));

        let lock = verdict
            .checks()
            .iter()
            .find(|c| c.check == CheckKind::LiquidityLock)
            .unwrap();
        assert_eq!(lock.outcome, CheckOutcome::TimedOut { after_ms: 3000 });
    }

    #[tokio::test]
    async fn test_failure_and_unknown_both_reject() {
        let v = validator_with(vec![
            (CheckKind::Honeypot, StubOracle::new(Behaviour::Fail("sell tax 100%"))),
            (CheckKind::ContractFlags, StubOracle::new(Behaviour::Error)),
        ]);

        let verdict = v.check(&token()).await;
        assert!(!verdict.passed());
        assert_eq!(verdict.reasons().len(), 2);
        assert!(verdict.reasons().iter().any(|r| r.contains("sell tax 100%")));
        assert!(verdict.reasons().iter().any(|r| r.contains("unknown")));
    }

    #[tokio::test]
    async fn test_missing_oracle_fails_closed() {
        let v = Validator::new(Duration::from_millis(100))
            .with_oracle(CheckKind::Honeypot, StubOracle::new(Behaviour::Pass), limiter());

        let verdict = v.check(&token()).await;
        assert!(!verdict.passed());
        assert_eq!(verdict.reasons().len(), 3);
    }

    #[test]
    fn test_validated_candidate_requires_passed_verdict_for_same_token() {
        let failed = SafetyVerdict::from_checks(
            token(),
            vec![CheckResult {
                check: CheckKind::Honeypot,
                outcome: CheckOutcome::Failed("honeypot".into()),
            }],
        );
        assert!(ValidatedCandidate::new(candidate(), failed).is_err());

        let other = TokenKey::parse("solana", "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU").unwrap();
        let passed_other = SafetyVerdict::from_checks(
            other,
            CheckKind::ALL
                .iter()
                .map(|&check| CheckResult {
                    check,
                    outcome: CheckOutcome::Passed,
                })
                .collect(),
        );
        assert!(passed_other.passed());
        assert!(ValidatedCandidate::new(candidate(), passed_other).is_err());
    }

    #[tokio::test]
    async fn test_workers_forward_only_passed() {
        let honeypot = StubOracle::new(Behaviour::Pass);
        let v = Arc::new(validator_with(vec![(CheckKind::Honeypot, honeypot.clone())]));

        let (cand_tx, cand_rx) = async_channel::bounded(4);
        let (val_tx, val_rx) = async_channel::unbounded();
        let shutdown = CancellationToken::new();
        let handles = v.spawn_workers(2, cand_rx, val_tx, shutdown.clone());

        cand_tx.send(candidate()).await.unwrap();
        let validated = val_rx.recv().await.unwrap();
        assert_eq!(validated.token(), &token());
        assert_eq!(honeypot.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejected_candidate_not_forwarded() {
        let v = Arc::new(validator_with(vec![(
            CheckKind::HolderConcentration,
            StubOracle::new(Behaviour::Fail("top holder 60%")),
        )]));

        let (cand_tx, cand_rx) = async_channel::bounded(4);
        let (val_tx, val_rx) = async_channel::unbounded();
        let shutdown = CancellationToken::new();
        let handles = v.spawn_workers(1, cand_rx, val_tx, shutdown.clone());

        cand_tx.send(candidate()).await.unwrap();
        // Closing the input lets the worker drain and exit
        drop(cand_tx);
        for h in handles {
            h.await.unwrap();
        }
        assert!(val_rx.try_recv().is_err());
    }
}

//! Windowed signal aggregation
//!
//! Signals are bucketed by `(token, window)` where windows are aligned
//! tumbling intervals (`floor(observed_at / window)`), so whether a token
//! emits in a window depends only on the signals and their timestamps,
//! never on arrival order. Each bucket emits at most one `Candidate`.

pub mod scoring;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::signal::{Signal, TokenKey};
use scoring::ConfluenceScorer;

/// A token that crossed the confluence threshold inside one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub token: TokenKey,
    pub confluence_score: f64,
    pub contributing_sources: BTreeSet<String>,
    pub first_seen_at: DateTime<Utc>,
    /// End of the window the candidate was emitted in
    pub window_closed_at: DateTime<Utc>,
    /// When the score first reached the threshold
    pub crossed_at: DateTime<Utc>,
}

/// What happened to an ingested signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New source for the bucket, threshold not (newly) crossed
    Added,
    /// Source already reported this token in this window
    Duplicate,
    /// Window already expired
    Late,
    /// This signal pushed the bucket over the threshold
    Crossed,
}

#[derive(Debug, Clone)]
struct SourceHit {
    first_seen: DateTime<Utc>,
    weight: f64,
}

#[derive(Debug, Default)]
struct Bucket {
    sources: BTreeMap<String, SourceHit>,
    emitted: bool,
}

pub struct Aggregator {
    scorer: ConfluenceScorer,
    emit_threshold: f64,
    window_ms: i64,
    lateness: chrono::Duration,
    buckets: HashMap<(TokenKey, i64), Bucket>,
    pending: Vec<Candidate>,
    low_watermark: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            scorer: ConfluenceScorer::new(config.formula, config.source_weights.clone()),
            emit_threshold: config.emit_threshold,
            window_ms: (config.window_secs.max(1) * 1000) as i64,
            lateness: chrono::Duration::seconds(config.lateness_secs as i64),
            buckets: HashMap::new(),
            pending: Vec::new(),
            low_watermark: None,
        }
    }

    fn window_index(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp_millis().div_euclid(self.window_ms)
    }

    fn window_start(&self, index: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(index.saturating_mul(self.window_ms))
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Add one signal to its token's bucket
    pub fn ingest(&mut self, signal: Signal) -> IngestOutcome {
        let index = self.window_index(signal.observed_at);
        let window_end = self.window_start(index + 1);

        if let Some(watermark) = self.low_watermark {
            if window_end <= watermark {
                debug!(token = %signal.token, source = %signal.source_id, "Dropping late signal");
                return IngestOutcome::Late;
            }
        }

        let weight = self
            .scorer
            .weight_for(&signal.source_id, signal.quality_weight);
        let key = (signal.token.clone(), index);
        let bucket = self.buckets.entry(key).or_default();

        if let Some(hit) = bucket.sources.get_mut(&signal.source_id) {
            // Keep the earliest sighting so replays and reordering converge
            if signal.observed_at < hit.first_seen {
                hit.first_seen = signal.observed_at;
            }
            return IngestOutcome::Duplicate;
        }

        bucket.sources.insert(
            signal.source_id.clone(),
            SourceHit {
                first_seen: signal.observed_at,
                weight,
            },
        );

        if bucket.emitted {
            return IngestOutcome::Added;
        }

        let score = self.scorer.score(bucket.sources.values().map(|h| h.weight));
        if score < self.emit_threshold {
            debug!(token = %signal.token, score, "Signal added");
            return IngestOutcome::Added;
        }

        bucket.emitted = true;
        let candidate = Self::build_candidate(
            &self.scorer,
            self.emit_threshold,
            &signal.token,
            bucket,
            score,
            window_end,
        );
        info!(
            token = %candidate.token,
            score = candidate.confluence_score,
            sources = ?candidate.contributing_sources,
            "Confluence threshold crossed"
        );
        self.pending.push(candidate);
        IngestOutcome::Crossed
    }

    fn build_candidate(
        scorer: &ConfluenceScorer,
        threshold: f64,
        token: &TokenKey,
        bucket: &Bucket,
        score: f64,
        window_end: DateTime<Utc>,
    ) -> Candidate {
        let mut hits: Vec<(&String, &SourceHit)> = bucket.sources.iter().collect();
        hits.sort_by(|a, b| a.1.first_seen.cmp(&b.1.first_seen).then_with(|| a.0.cmp(b.0)));

        let first_seen_at = hits.first().map(|(_, h)| h.first_seen).unwrap_or(window_end);

        // Earliest prefix (in observed-time order) that reaches the threshold
        let mut crossed_at = hits.last().map(|(_, h)| h.first_seen).unwrap_or(window_end);
        for n in 1..=hits.len() {
            if scorer.score(hits[..n].iter().map(|(_, h)| h.weight)) >= threshold {
                crossed_at = hits[n - 1].1.first_seen;
                break;
            }
        }

        Candidate {
            token: token.clone(),
            confluence_score: score,
            contributing_sources: bucket.sources.keys().cloned().collect(),
            first_seen_at,
            window_closed_at: window_end,
            crossed_at,
        }
    }

    /// Candidates crossed since the last drain, in crossing-time order
    pub fn drain_ready(&mut self) -> Vec<Candidate> {
        let mut ready = std::mem::take(&mut self.pending);
        ready.sort_by(|a, b| {
            a.crossed_at
                .cmp(&b.crossed_at)
                .then_with(|| a.token.cmp(&b.token))
        });
        ready
    }

    /// Drop windows that ended more than `lateness` before `now`
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let watermark = now - self.lateness;
        let window_ms = self.window_ms;
        let before = self.buckets.len();

        self.buckets.retain(|(_, index), _| {
            let end_ms = (index + 1).saturating_mul(window_ms);
            end_ms > watermark.timestamp_millis()
        });

        if self.low_watermark.map_or(true, |w| watermark > w) {
            self.low_watermark = Some(watermark);
        }

        before - self.buckets.len()
    }

    /// Current score for a token's window containing `at`
    pub fn score_of(&self, token: &TokenKey, at: DateTime<Utc>) -> Option<f64> {
        let bucket = self.buckets.get(&(token.clone(), self.window_index(at)))?;
        Some(self.scorer.score(bucket.sources.values().map(|h| h.weight)))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Consume signals and forward candidates until shutdown
    pub async fn run(
        mut self,
        signal_rx: async_channel::Receiver<Signal>,
        candidate_tx: async_channel::Sender<Candidate>,
        expiry_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut expiry = tokio::time::interval(expiry_interval);
        info!("Aggregator started");

        loop {
            tokio::select! {
                received = signal_rx.recv() => {
                    let Ok(signal) = received else { break };
                    self.ingest(signal);
                    // Take whatever else is already queued so simultaneous
                    // crossings are released in crossing order
                    while let Ok(signal) = signal_rx.try_recv() {
                        self.ingest(signal);
                    }
                    for candidate in self.drain_ready() {
                        if candidate_tx.send(candidate).await.is_err() {
                            warn!("Candidate channel closed");
                            return;
                        }
                    }
                }
                _ = expiry.tick() => {
                    let dropped = self.expire(Utc::now());
                    if dropped > 0 {
                        debug!("Expired {} aggregation windows", dropped);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreFormula;

    const MINT_A: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";
    const MINT_B: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            window_secs: 120,
            emit_threshold: 0.7,
            formula: ScoreFormula::WeightedSum,
            source_weights: HashMap::new(),
            lateness_secs: 0,
            channel_capacity: 16,
        }
    }

    /// Start of an aligned window, plus offset seconds
    fn at(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040 + offset_secs, 0).unwrap()
    }

    fn signal(source: &str, weight: f64, mint: &str, offset_secs: i64) -> Signal {
        Signal {
            source_id: source.into(),
            token: TokenKey::parse("solana", mint).unwrap(),
            observed_at: at(offset_secs),
            quality_weight: weight,
            raw_ref: format!("{}-{}", source, offset_secs),
        }
    }

    #[test]
    fn test_emits_after_second_source_not_first() {
        let mut agg = Aggregator::new(&config());

        assert_eq!(agg.ingest(signal("onchain", 0.4, MINT_A, 1)), IngestOutcome::Added);
        assert!(agg.drain_ready().is_empty());

        assert_eq!(agg.ingest(signal("social", 0.4, MINT_A, 5)), IngestOutcome::Crossed);
        let ready = agg.drain_ready();
        assert_eq!(ready.len(), 1);
        assert!((ready[0].confluence_score - 0.8).abs() < 1e-9);
        assert_eq!(ready[0].contributing_sources.len(), 2);
        assert_eq!(ready[0].first_seen_at, at(1));
        assert_eq!(ready[0].crossed_at, at(5));

        // Third source does not re-emit in the same window
        assert_eq!(agg.ingest(signal("listing", 0.2, MINT_A, 9)), IngestOutcome::Added);
        assert!(agg.drain_ready().is_empty());
    }

    #[test]
    fn test_repeats_from_one_source_do_not_inflate() {
        let mut agg = Aggregator::new(&config());
        let token = TokenKey::parse("solana", MINT_A).unwrap();

        agg.ingest(signal("onchain", 0.4, MINT_A, 1));
        for i in 0..10 {
            assert_eq!(
                agg.ingest(signal("onchain", 0.4, MINT_A, 2 + i)),
                IngestOutcome::Duplicate
            );
        }
        assert!((agg.score_of(&token, at(1)).unwrap() - 0.4).abs() < 1e-9);
        assert!(agg.drain_ready().is_empty());

        // A second source is worth more than any number of repeats
        assert_eq!(agg.ingest(signal("social", 0.4, MINT_A, 30)), IngestOutcome::Crossed);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut once = Aggregator::new(&config());
        let mut twice = Aggregator::new(&config());
        let token = TokenKey::parse("solana", MINT_A).unwrap();

        let s = signal("onchain", 0.4, MINT_A, 3);
        once.ingest(s.clone());
        twice.ingest(s.clone());
        twice.ingest(s);

        assert_eq!(once.bucket_count(), twice.bucket_count());
        assert_eq!(once.score_of(&token, at(3)), twice.score_of(&token, at(3)));
    }

    #[test]
    fn test_at_most_one_candidate_under_reordering() {
        let base = vec![
            signal("a", 0.4, MINT_A, 10),
            signal("b", 0.4, MINT_A, 20),
            signal("c", 0.2, MINT_A, 30),
            signal("a", 0.4, MINT_A, 40),
            signal("b", 0.4, MINT_A, 50),
        ];

        // Every rotation plus the reversed order
        let mut orders: Vec<Vec<Signal>> = (0..base.len())
            .map(|r| {
                let mut v = base.clone();
                v.rotate_left(r);
                v
            })
            .collect();
        orders.push(base.iter().rev().cloned().collect());

        for order in orders {
            let mut agg = Aggregator::new(&config());
            let mut emitted = Vec::new();
            for s in order {
                agg.ingest(s.clone());
                agg.ingest(s);
                emitted.extend(agg.drain_ready());
            }
            assert_eq!(emitted.len(), 1);
            assert_eq!(emitted[0].token.address, MINT_A);
        }
    }

    #[test]
    fn test_simultaneous_crossings_released_in_crossing_order() {
        let mut agg = Aggregator::new(&config());

        // Token B inserted first but crosses later than token A
        agg.ingest(signal("a", 0.4, MINT_B, 1));
        agg.ingest(signal("b", 0.4, MINT_B, 50));
        agg.ingest(signal("a", 0.4, MINT_A, 2));
        agg.ingest(signal("b", 0.4, MINT_A, 10));

        let ready = agg.drain_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].token.address, MINT_A);
        assert_eq!(ready[1].token.address, MINT_B);
    }

    #[test]
    fn test_expired_window_never_reemits() {
        let mut agg = Aggregator::new(&config());

        agg.ingest(signal("a", 0.4, MINT_A, 1));
        assert_eq!(agg.expire(at(121)), 1);
        assert_eq!(agg.bucket_count(), 0);

        // Late signal for the dropped window is rejected
        assert_eq!(agg.ingest(signal("b", 0.4, MINT_A, 60)), IngestOutcome::Late);
        assert!(agg.drain_ready().is_empty());

        // The next window starts fresh
        agg.ingest(signal("a", 0.4, MINT_A, 125));
        assert_eq!(agg.ingest(signal("b", 0.4, MINT_A, 130)), IngestOutcome::Crossed);
    }

    #[test]
    fn test_windows_are_independent() {
        let mut agg = Aggregator::new(&config());
        agg.ingest(signal("a", 0.4, MINT_A, 100));
        // Different window, so no confluence
        assert_eq!(agg.ingest(signal("b", 0.4, MINT_A, 130)), IngestOutcome::Added);
        assert!(agg.drain_ready().is_empty());
    }

    #[tokio::test]
    async fn test_run_forwards_candidates() {
        let agg = Aggregator::new(&config());
        let (signal_tx, signal_rx) = async_channel::unbounded();
        let (candidate_tx, candidate_rx) = async_channel::unbounded();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(agg.run(
            signal_rx,
            candidate_tx,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        let now = Utc::now();
        for source in ["a", "b"] {
            signal_tx
                .send(Signal {
                    source_id: source.into(),
                    token: TokenKey::parse("solana", MINT_A).unwrap(),
                    observed_at: now,
                    quality_weight: 0.4,
                    raw_ref: String::new(),
                })
                .await
                .unwrap();
        }

        let candidate = candidate_rx.recv().await.unwrap();
        assert_eq!(candidate.contributing_sources.len(), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

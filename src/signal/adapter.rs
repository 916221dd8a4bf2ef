//! Source adapter contract and supervision
//!
//! One supervisor task per adapter. A feed outage is never fatal: after
//! `degraded_after_failures` failed sessions the adapter is reported
//! degraded and reconnects on an exponential backoff (10s, 20s, 40s ...
//! capped at 5 min) until a session succeeds again.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Observation, Signal, SourceKind};
use crate::alert::{Alert, AlertSink};
use crate::config::AdapterBackoffConfig;
use crate::error::{Error, Result};

/// A normalizing adapter over one upstream feed
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source id used for dedupe and weighting
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Connect and forward observations until the feed ends or fails.
    ///
    /// Implementations call `sink.mark_connected()` once the feed is known
    /// to be reachable so the supervisor can reset its backoff.
    async fn run_session(&self, sink: &SignalSink) -> Result<()>;
}

/// Stamps observations with source identity and weight, then forwards
/// them onto the shared ingestion channel
#[derive(Clone)]
pub struct SignalSink {
    source_id: Arc<str>,
    weight: f64,
    tx: async_channel::Sender<Signal>,
    progress: Arc<AtomicU64>,
}

impl SignalSink {
    pub fn new(source_id: &str, weight: f64, tx: async_channel::Sender<Signal>) -> Self {
        Self {
            source_id: Arc::from(source_id),
            weight,
            tx,
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit one normalized signal
    pub async fn emit(&self, observation: Observation) -> Result<()> {
        let signal = Signal {
            source_id: self.source_id.to_string(),
            token: observation.token,
            observed_at: observation.observed_at,
            quality_weight: self.weight,
            raw_ref: observation.raw_ref,
        };

        self.tx
            .send(signal)
            .await
            .map_err(|_| Error::Internal("signal ingestion channel closed".into()))?;
        self.progress.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record that the feed is reachable
    pub fn mark_connected(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

/// Adapter health as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Healthy,
    Degraded,
}

#[derive(Debug, Default)]
pub struct AdapterHealth {
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl AdapterHealth {
    pub fn state(&self) -> AdapterState {
        if self.degraded.load(Ordering::Relaxed) {
            AdapterState::Degraded
        } else {
            AdapterState::Healthy
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Returns true if the adapter was degraded before this success
    fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.degraded.swap(false, Ordering::Relaxed)
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Runs one adapter forever with reconnect/backoff
pub struct AdapterSupervisor {
    adapter: Arc<dyn SourceAdapter>,
    sink: SignalSink,
    config: AdapterBackoffConfig,
    alerts: AlertSink,
    health: Arc<AdapterHealth>,
}

impl AdapterSupervisor {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        sink: SignalSink,
        config: AdapterBackoffConfig,
        alerts: AlertSink,
    ) -> Self {
        Self {
            adapter,
            sink,
            config,
            alerts,
            health: Arc::new(AdapterHealth::default()),
        }
    }

    pub fn health(&self) -> Arc<AdapterHealth> {
        self.health.clone()
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(self.config.initial_secs))
            .with_multiplier(self.config.multiplier)
            .with_max_interval(Duration::from_secs(self.config.max_secs))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Supervise the adapter until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        let source_id = self.adapter.id().to_string();
        let max_delay = Duration::from_secs(self.config.max_secs);
        let mut backoff = self.new_backoff();

        info!(source = %source_id, kind = %self.adapter.kind(), "Source adapter starting");

        loop {
            let before = self.sink.progress();

            let result = tokio::select! {
                r = self.adapter.run_session(&self.sink) => r,
                _ = shutdown.cancelled() => break,
            };

            if self.sink.progress() > before {
                if self.health.record_success() {
                    info!(source = %source_id, "Source recovered, resuming emission");
                }
                backoff.reset();
            }

            match result {
                Ok(()) => debug!(source = %source_id, "Source session ended"),
                Err(e) if self.sink.progress() == before => {
                    let failures = self.health.record_failure();
                    debug!(source = %source_id, failures, "Source unavailable: {}", e);

                    if failures == self.config.degraded_after_failures {
                        self.health.degraded.store(true, Ordering::Relaxed);
                        self.alerts.raise(Alert::SourceDegraded {
                            source_id: source_id.clone(),
                            consecutive_failures: failures,
                        });
                    }
                }
                Err(e) => warn!(source = %source_id, "Source session dropped: {}", e),
            }

            let delay = backoff.next_backoff().unwrap_or(max_delay);
            debug!(source = %source_id, "Reconnecting in {:?}", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!(source = %source_id, "Source adapter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::TokenKey;
    use std::sync::Mutex;
    use tokio::time::Instant;

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    struct FlakyAdapter {
        fail_first: u32,
        calls: AtomicU32,
        call_times: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl SourceAdapter for FlakyAdapter {
        fn id(&self) -> &str {
            "flaky"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Social
        }

        async fn run_session(&self, sink: &SignalSink) -> Result<()> {
            self.call_times.lock().unwrap().push(Instant::now());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::SourceConnection("connection refused".into()));
            }
            sink.mark_connected();
            let token = TokenKey::parse("solana", MINT)?;
            sink.emit(Observation::now(token, "post-1")).await?;
            Ok(())
        }
    }

    fn test_config() -> AdapterBackoffConfig {
        AdapterBackoffConfig {
            initial_secs: 10,
            max_secs: 300,
            multiplier: 2.0,
            degraded_after_failures: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrades_then_recovers_with_exponential_backoff() {
        let adapter = Arc::new(FlakyAdapter {
            fail_first: 4,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        });
        let (tx, rx) = async_channel::unbounded();
        let alerts = AlertSink::new();
        let mut alert_rx = alerts.subscribe();

        let supervisor = AdapterSupervisor::new(
            adapter.clone(),
            SignalSink::new("flaky", 0.4, tx),
            test_config(),
            alerts,
        );
        let health = supervisor.health();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.source_id, "flaky");
        assert_eq!(signal.quality_weight, 0.4);

        match alert_rx.recv().await.unwrap() {
            Alert::SourceDegraded {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 3),
            other => panic!("unexpected alert {:?}", other),
        }

        // Recovered after the successful session
        assert_eq!(health.state(), AdapterState::Healthy);
        assert_eq!(health.consecutive_failures(), 0);

        shutdown.cancel();
        handle.await.unwrap();

        let times = adapter.call_times.lock().unwrap().clone();
        let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(&gaps[..4], &[10, 20, 40, 80]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let adapter = Arc::new(FlakyAdapter {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        });
        let (tx, _rx) = async_channel::unbounded();
        let supervisor = AdapterSupervisor::new(
            adapter.clone(),
            SignalSink::new("flaky", 0.4, tx),
            test_config(),
            AlertSink::new(),
        );
        let health = supervisor.health();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(health.state(), AdapterState::Degraded);
        let times = adapter.call_times.lock().unwrap().clone();
        let max_gap = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .max()
            .unwrap();
        assert_eq!(max_gap, 300);
    }
}

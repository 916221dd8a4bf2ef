//! Per-service request limiter
//!
//! Bounds concurrent requests to one oracle service and spaces request
//! starts by a minimum interval. Callers over the limit wait their turn,
//! nothing is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Error, Result};

pub struct ServiceLimiter {
    service: String,
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_start: Mutex<Option<Instant>>,
}

impl ServiceLimiter {
    pub fn new(service: &str, max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            service: service.to_string(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval,
            next_start: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Requests that could start right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a concurrency slot and the next start time
    ///
    /// The returned permit must be held for the duration of the request.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(format!("limiter for {} closed", self.service)))?;

        if !self.min_interval.is_zero() {
            let start_at = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                let start_at = next.map_or(now, |n| n.max(now));
                *next = Some(start_at + self.min_interval);
                start_at
            };
            if start_at > Instant::now() {
                trace!(service = %self.service, "Spacing request by {:?}", start_at - Instant::now());
                tokio::time::sleep_until(start_at).await;
            }
        }

        Ok(permit)
    }
}

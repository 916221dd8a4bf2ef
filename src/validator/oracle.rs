//! Safety oracle clients
//!
//! Oracles answer one check for one token with `{ "passed": bool, "reason": ... }`.
//! Anything other than a well-formed answer is an error, which the
//! validator treats as unknown (and therefore failed).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::CheckKind;
use crate::error::{Error, Result};
use crate::signal::TokenKey;

/// One oracle answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleAnswer {
    pub passed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl OracleAnswer {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// External service that can answer safety checks
#[async_trait]
pub trait SafetyOracle: Send + Sync {
    /// Service name, used for rate limiting and logs
    fn service(&self) -> &str;

    async fn check(&self, check: CheckKind, token: &TokenKey) -> Result<OracleAnswer>;
}

/// Oracle reached over HTTP: `GET {base_url}/{check}?chain=..&address=..`
pub struct HttpSafetyOracle {
    service: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpSafetyOracle {
    pub fn new(service: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            service: service.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url_for(&self, check: CheckKind) -> String {
        format!("{}/{}", self.base_url, check)
    }
}

#[async_trait]
impl SafetyOracle for HttpSafetyOracle {
    fn service(&self) -> &str {
        &self.service
    }

    async fn check(&self, check: CheckKind, token: &TokenKey) -> Result<OracleAnswer> {
        let resp = self
            .client
            .get(self.url_for(check))
            .query(&[("chain", token.chain.as_str()), ("address", token.address.as_str())])
            .send()
            .await
            .map_err(|e| Error::Oracle {
                service: self.service.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(Error::Oracle {
                service: self.service.clone(),
                reason: format!("HTTP {}", resp.status()),
            });
        }

        let answer: OracleAnswer = resp.json().await.map_err(|e| Error::Oracle {
            service: self.service.clone(),
            reason: format!("malformed answer: {}", e),
        })?;

        debug!(service = %self.service, %check, token = %token, passed = answer.passed, "Oracle answered");
        Ok(answer)
    }
}

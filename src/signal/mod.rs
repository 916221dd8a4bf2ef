//! Canonical signal model and source adapters
//!
//! Every upstream feed (on-chain events, social mentions, wallet-copy hits,
//! new-listing feeds) is normalized into one `Signal` shape at the adapter
//! boundary. Nothing downstream ever sees a feed's native payload.

pub mod adapter;
pub mod dexscreener;
pub mod pumpportal;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Error, Result};

pub use adapter::{AdapterHealth, AdapterState, AdapterSupervisor, SignalSink, SourceAdapter};

static EVM_ADDRESS: OnceLock<Regex> = OnceLock::new();

fn evm_address() -> &'static Regex {
    EVM_ADDRESS.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("Invalid EVM address regex"))
}

/// Chains whose addresses follow the EVM `0x` + 20 byte hex format
const EVM_CHAINS: &[&str] = &["ethereum", "base", "bsc", "arbitrum", "polygon", "optimism"];

/// Kind of upstream feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// On-chain event stream (boosts, large buys)
    OnChain,
    /// Social mention stream
    Social,
    /// Tracked wallet bought the token
    WalletCopy,
    /// Token newly listed / launched
    NewListing,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::OnChain => "on_chain",
            SourceKind::Social => "social",
            SourceKind::WalletCopy => "wallet_copy",
            SourceKind::NewListing => "new_listing",
        };
        f.write_str(s)
    }
}

/// Token identity: chain + normalized address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKey {
    pub chain: String,
    pub address: String,
}

impl TokenKey {
    /// Validate and normalize a token identity
    ///
    /// Solana addresses must decode from base58 to 32 bytes and keep their
    /// case; EVM addresses are lowercased.
    pub fn parse(chain: &str, address: &str) -> Result<Self> {
        let chain = chain.trim().to_ascii_lowercase();
        let address = address.trim();
        let invalid = || Error::InvalidToken {
            chain: chain.clone(),
            address: address.to_string(),
        };

        match chain.as_str() {
            "solana" | "sol" => {
                let bytes = bs58::decode(address).into_vec().map_err(|_| invalid())?;
                if bytes.len() != 32 {
                    return Err(invalid());
                }
                Ok(Self {
                    chain: "solana".into(),
                    address: address.to_string(),
                })
            }
            c if EVM_CHAINS.contains(&c) => {
                if !evm_address().is_match(address) {
                    return Err(invalid());
                }
                Ok(Self {
                    chain: chain.clone(),
                    address: address.to_ascii_lowercase(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

/// A single normalized observation from one source about one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source_id: String,
    pub token: TokenKey,
    pub observed_at: DateTime<Utc>,
    /// Static per-source reliability weight
    pub quality_weight: f64,
    /// Reference back to the raw event (tx signature, post id, url)
    pub raw_ref: String,
}

/// What an adapter hands to its sink before stamping
#[derive(Debug, Clone)]
pub struct Observation {
    pub token: TokenKey,
    pub observed_at: DateTime<Utc>,
    pub raw_ref: String,
}

impl Observation {
    pub fn now(token: TokenKey, raw_ref: impl Into<String>) -> Self {
        Self {
            token,
            observed_at: Utc::now(),
            raw_ref: raw_ref.into(),
        }
    }
}

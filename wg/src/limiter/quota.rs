//! Quota specifications keyed by provider and model
//!
//! A [`QuotaSpec`] turns published upstream limits (requests/minute,
//! tokens/minute) into the token bucket parameters both limiters enforce.
//! Published limits are scaled by a safety margin so independent processes
//! drifting slightly apart still stay under the real cap.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use gatestore::{BucketParams, BucketTake};
use serde::{Deserialize, Serialize};

/// One upstream to be rate limited: a provider/model pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub provider: String,
    pub model: String,
}

impl QuotaKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

impl FromStr for QuotaKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            _ => Err(format!("Invalid quota key '{}': expected provider:model", s)),
        }
    }
}

/// Published limits for one upstream, scaled by a margin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSpec {
    /// Requests per minute before the margin; None leaves requests unlimited
    #[serde(rename = "requests-per-minute", default)]
    pub requests_per_minute: Option<u64>,

    /// Tokens per minute before the margin; None leaves tokens unlimited
    #[serde(rename = "tokens-per-minute", default)]
    pub tokens_per_minute: Option<u64>,

    /// Fraction of the published limit actually spent (headroom for
    /// estimate error and processes racing each other)
    #[serde(default = "default_margin")]
    pub margin: f64,
}

fn default_margin() -> f64 {
    0.9
}

impl Default for QuotaSpec {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            tokens_per_minute: None,
            margin: default_margin(),
        }
    }
}

impl QuotaSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests_per_minute(mut self, limit: u64) -> Self {
        self.requests_per_minute = Some(limit);
        self
    }

    pub fn with_tokens_per_minute(mut self, limit: u64) -> Self {
        self.tokens_per_minute = Some(limit);
        self
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    /// Bucket takes for one call against `key` costing `tokens` tokens.
    /// Each configured limit contributes one bucket; a request always
    /// costs exactly 1 from the requests bucket.
    pub fn takes(&self, key: &QuotaKey, tokens: f64) -> Vec<BucketTake> {
        let mut takes = Vec::new();
        if let Some(rpm) = self.requests_per_minute {
            takes.push(BucketTake {
                key: format!("{}:requests", key),
                params: BucketParams::from_per_minute(rpm as f64 * self.margin),
                cost: 1.0,
            });
        }
        if let Some(tpm) = self.tokens_per_minute {
            takes.push(BucketTake {
                key: format!("{}:tokens", key),
                params: BucketParams::from_per_minute(tpm as f64 * self.margin),
                cost: tokens,
            });
        }
        takes
    }
}

/// All configured quotas, keyed by canonical `provider:model` strings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quotas {
    specs: BTreeMap<String, QuotaSpec>,
}

impl Quotas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: QuotaKey, spec: QuotaSpec) -> Self {
        self.specs.insert(key.to_string(), spec);
        self
    }

    pub fn get(&self, key: &QuotaKey) -> Option<&QuotaSpec> {
        self.specs.get(&key.to_string())
    }

    /// Bucket takes for one call, or None when `key` has no quota at all
    pub fn takes_for(&self, key: &QuotaKey, tokens: f64) -> Option<Vec<BucketTake>> {
        self.get(key).map(|spec| spec.takes(key, tokens))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QuotaSpec)> {
        self.specs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }
}

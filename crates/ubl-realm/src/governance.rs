// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rate-limit and quota gates over external limiter interfaces.
//!
//! The core does not implement throttling itself; it consumes the
//! [`RateLimiter`] and [`QuotaManager`] adapter contracts and turns their
//! refusals into `RATE_LIMITED` / `QUOTA_EXCEEDED` errors with retry-after
//! details. Memory implementations (fixed-window counters) back tests and
//! single-node deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ubl_core::{ErrorKind, LedgerError, LedgerResult};

/// What a rate limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateScope {
    /// The whole installation.
    Global,
    /// One realm.
    Realm {
        /// Realm id.
        realm_id: String,
    },
    /// One entity.
    Entity {
        /// Entity id.
        entity_id: String,
    },
    /// One intent name.
    Intent {
        /// Intent name.
        intent: String,
    },
    /// One API key.
    ApiKey {
        /// Key id (never the secret).
        key_id: String,
    },
}

impl RateScope {
    fn bucket(&self) -> String {
        match self {
            Self::Global => "global".into(),
            Self::Realm { realm_id } => format!("realm:{realm_id}"),
            Self::Entity { entity_id } => format!("entity:{entity_id}"),
            Self::Intent { intent } => format!("intent:{intent}"),
            Self::ApiKey { key_id } => format!("api_key:{key_id}"),
        }
    }
}

/// A limiter's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The scope's limit per window.
    pub limit: u32,
    /// Requests remaining in the window.
    pub remaining: u32,
    /// How long to wait when refused.
    pub retry_after_ms: Option<u64>,
}

/// External rate limiter contract.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check without consuming.
    async fn check(&self, scope: &RateScope) -> LedgerResult<RateDecision>;
    /// Consume one unit.
    async fn record(&self, scope: &RateScope) -> LedgerResult<()>;
}

/// A quota manager's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Units currently used.
    pub current: u64,
    /// The quota ceiling.
    pub limit: u64,
    /// Units remaining.
    pub remaining: u64,
}

/// External quota manager contract.
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Check whether `resource` has headroom, optionally per realm.
    async fn check(&self, resource: &str, realm_id: Option<&str>) -> LedgerResult<QuotaDecision>;
    /// Consume `amount` units of `resource`.
    async fn record(
        &self,
        resource: &str,
        amount: u64,
        realm_id: Option<&str>,
    ) -> LedgerResult<()>;
}

/// Fixed-window in-memory [`RateLimiter`].
pub struct MemoryRateLimiter {
    limit: u32,
    window_ms: u64,
    windows: Mutex<HashMap<String, (DateTime<Utc>, u32)>>,
}

impl MemoryRateLimiter {
    /// A limiter allowing `limit` requests per `window_ms` per scope.
    #[must_use]
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_state(&self, scope: &RateScope) -> (u32, u64) {
        let now = Utc::now();
        let mut windows = self.windows.lock().expect("rate windows poisoned");
        let entry = windows.entry(scope.bucket()).or_insert((now, 0));
        let age = now.signed_duration_since(entry.0).num_milliseconds();
        if age >= self.window_ms as i64 {
            *entry = (now, 0);
            (0, self.window_ms)
        } else {
            (entry.1, self.window_ms - age as u64)
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, scope: &RateScope) -> LedgerResult<RateDecision> {
        let (used, window_left_ms) = self.window_state(scope);
        let allowed = used < self.limit;
        Ok(RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(used),
            retry_after_ms: (!allowed).then_some(window_left_ms),
        })
    }

    async fn record(&self, scope: &RateScope) -> LedgerResult<()> {
        let _ = self.window_state(scope);
        let mut windows = self.windows.lock().expect("rate windows poisoned");
        if let Some(entry) = windows.get_mut(&scope.bucket()) {
            entry.1 += 1;
        }
        Ok(())
    }
}

/// In-memory [`QuotaManager`] with per-resource ceilings.
pub struct MemoryQuotaManager {
    limits: HashMap<String, u64>,
    used: Mutex<HashMap<String, u64>>,
}

impl MemoryQuotaManager {
    /// A manager with the given per-resource ceilings. Unlisted resources
    /// are unlimited.
    #[must_use]
    pub fn new(limits: HashMap<String, u64>) -> Self {
        Self {
            limits,
            used: Mutex::new(HashMap::new()),
        }
    }

    fn key(resource: &str, realm_id: Option<&str>) -> String {
        match realm_id {
            Some(realm) => format!("{resource}@{realm}"),
            None => resource.to_string(),
        }
    }
}

#[async_trait]
impl QuotaManager for MemoryQuotaManager {
    async fn check(&self, resource: &str, realm_id: Option<&str>) -> LedgerResult<QuotaDecision> {
        let limit = self.limits.get(resource).copied().unwrap_or(u64::MAX);
        let current = *self
            .used
            .lock()
            .expect("quota usage poisoned")
            .get(&Self::key(resource, realm_id))
            .unwrap_or(&0);
        Ok(QuotaDecision {
            allowed: current < limit,
            current,
            limit,
            remaining: limit.saturating_sub(current),
        })
    }

    async fn record(
        &self,
        resource: &str,
        amount: u64,
        realm_id: Option<&str>,
    ) -> LedgerResult<()> {
        *self
            .used
            .lock()
            .expect("quota usage poisoned")
            .entry(Self::key(resource, realm_id))
            .or_insert(0) += amount;
        Ok(())
    }
}

/// The governance gate consulted before intent handling.
pub struct GovernanceGate {
    limiter: std::sync::Arc<dyn RateLimiter>,
    quotas: std::sync::Arc<dyn QuotaManager>,
}

impl std::fmt::Debug for GovernanceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceGate").finish_non_exhaustive()
    }
}

impl GovernanceGate {
    /// Wire a gate over the adapter contracts.
    pub fn new(
        limiter: std::sync::Arc<dyn RateLimiter>,
        quotas: std::sync::Arc<dyn QuotaManager>,
    ) -> Self {
        Self { limiter, quotas }
    }

    /// Admit or refuse a request, recording consumption on admit.
    ///
    /// # Errors
    ///
    /// `RATE_LIMITED` with a `retry_after_ms` detail, or `QUOTA_EXCEEDED`
    /// with the quota numbers.
    pub async fn admit(
        &self,
        scope: &RateScope,
        resource: &str,
        realm_id: Option<&str>,
    ) -> LedgerResult<()> {
        let rate = self.limiter.check(scope).await?;
        if !rate.allowed {
            let mut err = LedgerError::new(ErrorKind::RateLimited, "rate limit exceeded")
                .with_detail("limit", serde_json::json!(rate.limit));
            if let Some(retry) = rate.retry_after_ms {
                err = err.with_detail("retry_after_ms", serde_json::json!(retry));
            }
            return Err(err);
        }

        let quota = self.quotas.check(resource, realm_id).await?;
        if !quota.allowed {
            return Err(
                LedgerError::new(ErrorKind::QuotaExceeded, "quota exceeded")
                    .with_detail("current", serde_json::json!(quota.current))
                    .with_detail("limit", serde_json::json!(quota.limit)),
            );
        }

        self.limiter.record(scope).await?;
        self.quotas.record(resource, 1, realm_id).await?;
        Ok(())
    }
}

//! Consumer identity: supplied by the authentication collaborator
//! (spec.md 6), consumed but not implemented here.

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Paid,
}

/// One request/connection's worth of identity and quotas.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub name: String,
    pub seconds_quota: i64,
    pub monthly_quota: i64,
    pub tier: Tier,
}

impl Consumer {
    pub fn new(name: impl Into<String>, seconds_quota: i64, monthly_quota: i64, paid_threshold: i64) -> Self {
        let tier = if monthly_quota > paid_threshold {
            Tier::Paid
        } else {
            Tier::Free
        };
        Self {
            name: name.into(),
            seconds_quota,
            monthly_quota,
            tier,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self.tier, Tier::Paid)
    }

    /// `seconds_quota == 0` disables per-second limiting (spec.md 3).
    pub fn rate_limit_enabled(&self) -> bool {
        self.seconds_quota > 0
    }

    /// `monthly_quota == 0` disables monthly enforcement (spec.md 3).
    pub fn monthly_quota_enabled(&self) -> bool {
        self.monthly_quota > 0
    }
}

#[derive(Debug, Clone)]
pub struct AuthRejection {
    pub status: axum::http::StatusCode,
    pub message: String,
}

/// External collaborator (spec.md 1, 6): given the inbound request's
/// headers, either rejects it or hands back a validated [`Consumer`]. The
/// gateway core consumes this trait; it never looks up API keys itself.
#[async_trait]
pub trait ConsumerAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
    ) -> Result<Consumer, AuthRejection>;
}

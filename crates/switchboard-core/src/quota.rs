//! Process-wide cache of the most recent premium-request quota.
//!
//! Engines report quota alongside usage. Only the latest snapshot matters, so
//! each report overwrites the previous one.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::event::QuotaSnapshot;

/// Premium-request quota as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfo {
    pub used: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<String>,
    pub unlimited: bool,
    pub updated_at: DateTime<Utc>,
}

impl QuotaInfo {
    /// Convert an engine snapshot. An entitlement of zero means unlimited.
    pub fn from_snapshot(snapshot: &QuotaSnapshot) -> Self {
        Self {
            used: snapshot.used_requests,
            total: snapshot.entitlement_requests,
            reset_date: snapshot.reset_date.clone(),
            unlimited: snapshot.entitlement_requests == 0,
            updated_at: Utc::now(),
        }
    }
}

/// Shared holder for the latest [`QuotaInfo`].
///
/// Cloning shares the underlying slot.
#[derive(Debug, Clone, Default)]
pub struct QuotaCache {
    latest: Arc<Mutex<Option<QuotaInfo>>>,
}

impl QuotaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached snapshot.
    pub fn store(&self, info: QuotaInfo) {
        *self.latest.lock().unwrap() = Some(info);
    }

    pub fn latest(&self) -> Option<QuotaInfo> {
        self.latest.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.latest.lock().unwrap().take();
    }
}

//! Per-lease sliding-window quota state. Windows are pruned before every
//! read; each rejection carries `retry_after_ms` derived from the oldest
//! timestamp in the saturated window.

use crate::error::{KmsError, KmsResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HOUR_MS: u64 = 60 * 60 * 1000;
pub const MINUTE_MS: u64 = 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub tokens_per_hour: u32,
    pub sends_per_minute: u32,
    pub burst_sends: u32,
    pub sends_per_minute_per_eid: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            tokens_per_hour: 120,
            sends_per_minute: 60,
            burst_sends: 100,
            sends_per_minute_per_eid: 30,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuotaState {
    pub tokens_in_last_hour: Vec<u64>,
    pub sends_in_last_minute: Vec<u64>,
    pub sends_in_last_minute_per_eid: BTreeMap<String, Vec<u64>>,
    pub in_flight_sends: u32,
    pub violations: u32,
}

impl QuotaState {
    /// Drop timestamps older than their window.
    pub fn prune(&mut self, now_ms: u64) {
        self.tokens_in_last_hour
            .retain(|t| now_ms.saturating_sub(*t) < HOUR_MS);
        self.sends_in_last_minute
            .retain(|t| now_ms.saturating_sub(*t) < MINUTE_MS);
        self.sends_in_last_minute_per_eid.retain(|_, stamps| {
            stamps.retain(|t| now_ms.saturating_sub(*t) < MINUTE_MS);
            !stamps.is_empty()
        });
    }

    /// Enforce, in order: per-lease tokens/hour, per-lease sends/minute,
    /// in-flight burst, per-endpoint sends/minute.
    pub fn check(&mut self, config: &QuotaConfig, eid: &str, now_ms: u64) -> KmsResult<()> {
        self.prune(now_ms);
        if self.tokens_in_last_hour.len() >= config.tokens_per_hour as usize {
            self.violations += 1;
            return Err(KmsError::QuotaExceededLease {
                retry_after_ms: retry_after(&self.tokens_in_last_hour, HOUR_MS, now_ms),
            });
        }
        if self.sends_in_last_minute.len() >= config.sends_per_minute as usize {
            self.violations += 1;
            return Err(KmsError::QuotaExceededLease {
                retry_after_ms: retry_after(&self.sends_in_last_minute, MINUTE_MS, now_ms),
            });
        }
        if self.in_flight_sends >= config.burst_sends {
            self.violations += 1;
            // In-flight sends carry no timestamps; the send-rate window is
            // what frees burst capacity next, so its oldest entry drives
            // the retry hint (full window when empty).
            return Err(KmsError::QuotaExceededLease {
                retry_after_ms: retry_after(&self.sends_in_last_minute, MINUTE_MS, now_ms),
            });
        }
        if let Some(stamps) = self.sends_in_last_minute_per_eid.get(eid) {
            if stamps.len() >= config.sends_per_minute_per_eid as usize {
                self.violations += 1;
                return Err(KmsError::QuotaExceededEndpoint {
                    retry_after_ms: retry_after(stamps, MINUTE_MS, now_ms),
                });
            }
        }
        Ok(())
    }

    /// Record a successful issuance against every window.
    pub fn record_issue(&mut self, eid: &str, now_ms: u64) {
        self.tokens_in_last_hour.push(now_ms);
        self.sends_in_last_minute.push(now_ms);
        self.sends_in_last_minute_per_eid
            .entry(eid.to_string())
            .or_default()
            .push(now_ms);
    }
}

/// Milliseconds until the oldest counter in the saturated window expires.
fn retry_after(stamps: &[u64], window_ms: u64, now_ms: u64) -> u64 {
    stamps
        .iter()
        .min()
        .map(|oldest| (oldest + window_ms).saturating_sub(now_ms))
        .unwrap_or(window_ms)
        .max(1)
}

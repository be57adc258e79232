use std::collections::BTreeMap;

/// Service-level error taxonomy. Every variant carries a stable structured
/// code (see [`KmsError::code`]) that callers match on; messages are for
/// humans and never contain secret material.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KmsError {
    #[error("unlock denied")]
    UnlockDenied,
    #[error("unlock timed out after {elapsed_ms}ms")]
    UnlockTimeout { elapsed_ms: u64 },
    #[error("unknown unlock method: {0}")]
    UnlockMethodUnknown(String),
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),
    #[error("configuration corrupted: {0}")]
    ConfigCorrupted(String),
    #[error("aad or tag mismatch")]
    AadMismatch,
    #[error("key check value invalid")]
    KcvInvalid,
    #[error("attestation failed")]
    AttestationFailed,
    #[error("lease quota exceeded")]
    QuotaExceededLease { retry_after_ms: u64 },
    #[error("endpoint quota exceeded")]
    QuotaExceededEndpoint { retry_after_ms: u64 },
    #[error("user quota exceeded")]
    QuotaExceededUser { retry_after_ms: u64 },
    #[error("relay quota exceeded")]
    QuotaExceededRelay { retry_after_ms: u64 },
    #[error("lease expired")]
    LeaseExpired,
    #[error("lease not found")]
    LeaseNotFound,
    #[error("lease revoked")]
    LeaseRevoked,
    #[error("endpoint is not part of the lease")]
    EndpointNotInLease,
    #[error("audience mismatch")]
    AudMismatch,
    #[error("unknown endpoint id")]
    EidUnknown,
    #[error("jti already issued inside its ttl window")]
    JtiCollision,
    #[error("audit chain broken: {0}")]
    AuditChainBroken(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type KmsResult<T> = Result<T, KmsError>;

impl KmsError {
    /// Stable structured code, the wire-level identity of the error.
    pub fn code(&self) -> &'static str {
        match self {
            KmsError::UnlockDenied => "unlock.denied",
            KmsError::UnlockTimeout { .. } => "unlock.timeout",
            KmsError::UnlockMethodUnknown(_) => "unlock.method.unknown",
            KmsError::ConfigNotFound(_) => "config.not.found",
            KmsError::ConfigCorrupted(_) => "config.corrupted",
            KmsError::AadMismatch => "aad.mismatch",
            KmsError::KcvInvalid => "kcv.invalid",
            KmsError::AttestationFailed => "attestation.failed",
            KmsError::QuotaExceededLease { .. } => "quota.exceeded.lease",
            KmsError::QuotaExceededEndpoint { .. } => "quota.exceeded.endpoint",
            KmsError::QuotaExceededUser { .. } => "quota.exceeded.user",
            KmsError::QuotaExceededRelay { .. } => "quota.exceeded.relay",
            KmsError::LeaseExpired => "lease.expired",
            KmsError::LeaseNotFound => "lease.not.found",
            KmsError::LeaseRevoked => "lease.revoked",
            KmsError::EndpointNotInLease => "endpoint.not.in.lease",
            KmsError::AudMismatch => "aud.mismatch",
            KmsError::EidUnknown => "eid.unknown",
            KmsError::JtiCollision => "jti.collision",
            KmsError::AuditChainBroken(_) => "audit.chain.broken",
            KmsError::Internal(_) => "internal",
        }
    }

    /// Milliseconds until the saturated quota window frees a slot, when the
    /// error is a quota rejection.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            KmsError::QuotaExceededLease { retry_after_ms }
            | KmsError::QuotaExceededEndpoint { retry_after_ms }
            | KmsError::QuotaExceededUser { retry_after_ms }
            | KmsError::QuotaExceededRelay { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Non-sensitive detail map for RPC responses and audit `details`.
    pub fn details(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(ms) = self.retry_after_ms() {
            out.insert("retry_after_ms".to_string(), ms.to_string());
        }
        if let KmsError::UnlockTimeout { elapsed_ms } = self {
            out.insert("elapsed_ms".to_string(), elapsed_ms.to_string());
        }
        out
    }

    /// `unlock.timeout` is retriable because cleanup already ran; quota
    /// errors are retriable after their window drains.
    pub fn is_retriable(&self) -> bool {
        matches!(self, KmsError::UnlockTimeout { .. }) || self.retry_after_ms().is_some()
    }
}

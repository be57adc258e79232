//! The lease engine: time-bounded authorization for background JWT
//! issuance. A lease owns a SessionKEK derived from the MS and a fresh
//! salt, a lease-wrapped copy of the VAPID key, quota state, and a LAK.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::audit::{AuditContext, SignerSel};
use crate::canonical::{aad_lease_wrap, b64u};
use crate::crypto::{aead_encrypt, scrub, uuid_v4};
use crate::delegation::DelegationCertificate;
use crate::error::{KmsError, KmsResult};
use crate::kdf::derive_session_kek;
use crate::kms::{keys, Kms};
use crate::quota::{QuotaConfig, QuotaState};
use crate::types::{Credential, Endpoint, Kid, LeaseId, UserId};
use crate::unlock::OpClass;
use serde::{Deserialize, Serialize};
use serde_json::json;
use zeroize::Zeroizing;

pub const LEASE_SCOPE: &str = "notifications:send";
pub const MAX_LEASE_MS: u64 = 24 * 60 * 60 * 1000;
const REVOCATION_SET_WINDOW_MS: u64 = 10 * 60 * 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub user_id: UserId,
    pub subs: Vec<Endpoint>,
    pub scope: String,
    pub exp_ms: u64,
    pub quotas: QuotaConfig,
    pub quota_state: QuotaState,
    pub kid: Kid,
    pub lease_salt: String,
    pub wrapped_lease_key: String,
    pub iv: String,
    pub aad: String,
    pub lak_delegation_cert: DelegationCertificate,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
    #[serde(default)]
    pub expiry_audited: bool,
}

impl Lease {
    /// Usable iff unexpired and not revoked.
    pub fn check_usable(&self, now_ms: u64) -> KmsResult<()> {
        if self.revoked_at.is_some() {
            return Err(KmsError::LeaseRevoked);
        }
        if now_ms >= self.exp_ms {
            return Err(KmsError::LeaseExpired);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseSummary {
    pub lease_id: LeaseId,
    pub exp_ms: u64,
    pub created_at: u64,
}

/// Caller-facing lease view; no key material.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub lease_id: LeaseId,
    pub user_id: UserId,
    pub scope: String,
    pub sub_count: usize,
    pub kid: Kid,
    pub exp_ms: u64,
    pub quotas: QuotaConfig,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
}

impl From<&Lease> for LeaseInfo {
    fn from(lease: &Lease) -> Self {
        Self {
            lease_id: lease.lease_id.clone(),
            user_id: lease.user_id.clone(),
            scope: lease.scope.clone(),
            sub_count: lease.subs.len(),
            kid: lease.kid.clone(),
            exp_ms: lease.exp_ms,
            quotas: lease.quotas,
            created_at: lease.created_at,
            revoked_at: lease.revoked_at,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreateLeaseRequest {
    pub user_id: UserId,
    pub subs: Vec<Endpoint>,
    pub ttl_hours: u64,
    pub credential: Credential,
    pub kid: Option<Kid>,
    pub quotas: Option<QuotaConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease_id: LeaseId,
    pub exp_ms: u64,
    pub quotas: QuotaConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevokeOutcome {
    pub status: String,
    pub effective_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
struct RevocationSet {
    entries: Vec<(String, u64)>,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    /// Lease-scoped entries are LAK-signed while the LAK's certificate
    /// window is open; afterwards the system signer takes over so the
    /// chain stays verifiable.
    fn lease_signer(&self, lease_id: &LeaseId) -> SignerSel {
        match self.load_lak(lease_id) {
            Ok(lak) if lak.cert.valid_at(self.clock.now_ms()) => {
                SignerSel::Lease(lease_id.clone())
            }
            _ => SignerSel::Instance,
        }
    }

    pub(crate) fn load_lease(&self, lease_id: &LeaseId) -> KmsResult<Lease> {
        self.store_get_json::<Lease>(&keys::lease(&lease_id.0))?
            .ok_or(KmsError::LeaseNotFound)
    }

    pub(crate) fn save_lease(&self, lease: &Lease) -> KmsResult<()> {
        self.store_put_json(&keys::lease(&lease.lease_id.0), lease)?;
        let mut index = self.load_lease_index()?;
        if let Some(entry) = index.iter_mut().find(|e| e.lease_id == lease.lease_id) {
            entry.exp_ms = lease.exp_ms;
        } else {
            index.push(LeaseSummary {
                lease_id: lease.lease_id.clone(),
                exp_ms: lease.exp_ms,
                created_at: lease.created_at,
            });
        }
        self.store_put_json(keys::LEASE_INDEX, &index)
    }

    pub(crate) fn load_lease_index(&self) -> KmsResult<Vec<LeaseSummary>> {
        Ok(self
            .store_get_json::<Vec<LeaseSummary>>(keys::LEASE_INDEX)?
            .unwrap_or_default())
    }

    /// Create a lease inside an unlock scope: derive the SessionKEK, rewrap
    /// the VAPID key under it, persist the SessionKEK handle, generate the
    /// LAK, and record the lease.
    pub fn create_lease(&mut self, req: CreateLeaseRequest) -> KmsResult<LeaseGrant> {
        if req.ttl_hours == 0 || req.ttl_hours > 24 {
            return Err(KmsError::Internal("lease ttl out of range".to_string()));
        }
        if req.subs.is_empty() {
            return Err(KmsError::EidUnknown);
        }
        let credential = req.credential.clone();
        self.with_unlock(&credential, OpClass::Default, move |kms, scope| {
            let now = kms.clock.now_ms();
            let lease_id = LeaseId(uuid_v4(&kms.entropy));
            let lease_salt = kms.entropy.random_bytes(32);
            let exp_ms = now + req.ttl_hours * 60 * 60 * 1000;

            let session_kek = derive_session_kek(scope.ms(), &lease_salt)?;
            scope.check_deadline(kms.clock.now_ms())?;

            let kid = match &req.kid {
                Some(kid) => kid.clone(),
                None => kms.latest_vapid_kid()?,
            };
            let record = kms.load_key(&kid)?;
            let mut raw = Zeroizing::new(kms.unwrap_raw(&record, scope.mkek())?);
            let aad = aad_lease_wrap(&lease_id.0, &kid.0)?;
            let iv = kms.entropy.random_bytes(12);
            let wrapped_lease_key = aead_encrypt(session_kek.as_ref(), &aad, &raw, &iv)?;
            scrub(&kms.entropy, &mut raw[..]);
            scope.check_deadline(kms.clock.now_ms())?;

            // The SessionKEK handle survives restarts but is useless once
            // the lease is pruned.
            kms.store_put_raw(&keys::session_kek(&lease_id.0), session_kek.as_ref())?;
            kms.session_keks
                .insert(lease_id.0.clone(), Zeroizing::new(session_kek.as_ref().to_vec()));

            // LAK certificate validity spans the maximum lease lifetime so
            // later extensions stay inside the delegation window.
            let lak = kms.issue_lak(scope.mkek(), &lease_id, lease_created_cert_bound(now))?;

            let quotas = req.quotas.unwrap_or(kms.config.policy.default_quotas);
            let lease = Lease {
                lease_id: lease_id.clone(),
                user_id: req.user_id.clone(),
                subs: req.subs.clone(),
                scope: LEASE_SCOPE.to_string(),
                exp_ms,
                quotas,
                quota_state: QuotaState::default(),
                kid: kid.clone(),
                lease_salt: b64u(&lease_salt),
                wrapped_lease_key: b64u(&wrapped_lease_key),
                iv: b64u(&iv),
                aad: b64u(&aad),
                lak_delegation_cert: lak.cert.clone(),
                created_at: now,
                updated_at: now,
                revoked_at: None,
                expiry_audited: false,
            };
            kms.save_lease(&lease)?;

            let ctx = AuditContext {
                kid: Some(kid),
                request_id: scope.request_id.clone(),
                lease_id: Some(lease_id.clone()),
                details: Some(json!({
                    "user_id": req.user_id.0,
                    "sub_count": req.subs.len(),
                    "exp_ms": exp_ms,
                })),
                ..AuditContext::default()
            };
            let mkek = Zeroizing::new(*scope.mkek());
            kms.append_audit("lease:create", ctx, SignerSel::User(mkek))?;
            tracing::debug!(lease = %lease_id.0, "lease created");

            Ok(LeaseGrant { lease_id, exp_ms, quotas })
        })
    }

    /// Extend a lease; total lifetime stays within 24 hours of creation.
    pub fn extend_lease(&mut self, lease_id: &LeaseId, add_hours: u64) -> KmsResult<u64> {
        self.ensure_operational()?;
        let mut lease = self.load_lease(lease_id)?;
        let now = self.clock.now_ms();
        lease.check_usable(now)?;
        let proposed = lease
            .exp_ms
            .saturating_add(add_hours.saturating_mul(60 * 60 * 1000));
        let bound = lease.created_at + MAX_LEASE_MS;
        lease.exp_ms = proposed.min(bound);
        lease.updated_at = now;
        self.save_lease(&lease)?;
        let ctx = AuditContext {
            request_id: uuid_v4(&self.entropy),
            lease_id: Some(lease_id.clone()),
            details: Some(json!({ "exp_ms": lease.exp_ms })),
            ..AuditContext::default()
        };
        let signer = self.lease_signer(lease_id);
        self.append_audit("lease:extend", ctx, signer)?;
        Ok(lease.exp_ms)
    }

    /// Revoke immediately for new issuance. In-flight tokens run to their
    /// natural expiry; that horizon is outside the core's reach.
    pub fn revoke_lease(&mut self, lease_id: &LeaseId) -> KmsResult<RevokeOutcome> {
        self.ensure_operational()?;
        let mut lease = self.load_lease(lease_id)?;
        if lease.revoked_at.is_some() {
            return Err(KmsError::LeaseRevoked);
        }
        let now = self.clock.now_ms();
        lease.revoked_at = Some(now);
        lease.updated_at = now;
        self.save_lease(&lease)?;

        let mut set = self.load_revocation_set()?;
        set.entries.push((lease_id.0.clone(), now));
        self.save_revocation_set(&mut set)?;

        self.evict_session_kek(lease_id)?;

        let ctx = AuditContext {
            request_id: uuid_v4(&self.entropy),
            lease_id: Some(lease_id.clone()),
            details: Some(json!({ "effective_at_ms": now })),
            ..AuditContext::default()
        };
        let signer = self.lease_signer(lease_id);
        self.append_audit("lease:revoke", ctx, signer)?;
        tracing::warn!(lease = %lease_id.0, "lease revoked");
        Ok(RevokeOutcome {
            status: "revoked".to_string(),
            effective_at_ms: now,
        })
    }

    /// Sweep expired leases: audit `lease:expire` once and drop their
    /// SessionKEK material.
    pub fn prune_expired_leases(&mut self) -> KmsResult<usize> {
        self.ensure_operational()?;
        let now = self.clock.now_ms();
        let index = self.load_lease_index()?;
        let mut pruned = 0;
        for summary in index {
            if now < summary.exp_ms {
                continue;
            }
            let mut lease = match self.load_lease(&summary.lease_id) {
                Ok(lease) => lease,
                Err(_) => continue,
            };
            if lease.expiry_audited {
                continue;
            }
            lease.expiry_audited = true;
            lease.updated_at = now;
            self.save_lease(&lease)?;
            self.evict_session_kek(&summary.lease_id)?;
            let ctx = AuditContext {
                request_id: uuid_v4(&self.entropy),
                lease_id: Some(summary.lease_id.clone()),
                details: Some(json!({ "exp_ms": lease.exp_ms })),
                ..AuditContext::default()
            };
            let signer = self.lease_signer(&summary.lease_id);
            self.append_audit("lease:expire", ctx, signer)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// SessionKEK for a lease: memory cache first, then the persisted
    /// opaque handle.
    pub(crate) fn session_kek_for(&mut self, lease_id: &LeaseId) -> KmsResult<Zeroizing<[u8; 32]>> {
        if let Some(cached) = self.session_keks.get(&lease_id.0) {
            let mut out = Zeroizing::new([0u8; 32]);
            if cached.len() != 32 {
                return Err(KmsError::ConfigCorrupted("session kek handle".to_string()));
            }
            out.copy_from_slice(cached);
            return Ok(out);
        }
        let raw = self
            .store_get_raw(&keys::session_kek(&lease_id.0))?
            .ok_or(KmsError::LeaseNotFound)?;
        if raw.len() != 32 {
            return Err(KmsError::ConfigCorrupted("session kek handle".to_string()));
        }
        self.session_keks
            .insert(lease_id.0.clone(), Zeroizing::new(raw.clone()));
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&raw);
        Ok(out)
    }

    pub fn get_lease(&self, lease_id: &LeaseId) -> KmsResult<LeaseInfo> {
        self.ensure_operational()?;
        Ok(LeaseInfo::from(&self.load_lease(lease_id)?))
    }

    pub fn list_leases(&self) -> KmsResult<Vec<LeaseInfo>> {
        self.ensure_operational()?;
        self.load_lease_index()?
            .iter()
            .map(|summary| Ok(LeaseInfo::from(&self.load_lease(&summary.lease_id)?)))
            .collect()
    }

    /// Drop the in-memory SessionKEK cache; persisted handles refill it on
    /// the next issuance.
    pub fn drop_session_kek_cache(&mut self) {
        self.session_keks.clear();
    }

    pub(crate) fn evict_session_kek(&mut self, lease_id: &LeaseId) -> KmsResult<()> {
        self.session_keks.remove(&lease_id.0);
        self.store_delete(&keys::session_kek(&lease_id.0))
    }

    fn load_revocation_set(&self) -> KmsResult<RevocationSet> {
        Ok(self
            .store_get_json::<RevocationSet>(keys::REVOKED_LEASES)?
            .unwrap_or_default())
    }

    fn save_revocation_set(&self, set: &mut RevocationSet) -> KmsResult<()> {
        let now = self.clock.now_ms();
        set.entries
            .retain(|(_, at)| now.saturating_sub(*at) < REVOCATION_SET_WINDOW_MS);
        self.store_put_json(keys::REVOKED_LEASES, set)
    }

    /// Best-effort emergency check against the rolling revocation set; the
    /// lease record's `revoked_at` stays authoritative.
    pub(crate) fn recently_revoked(&self, lease_id: &LeaseId) -> KmsResult<bool> {
        let set = self.load_revocation_set()?;
        let now = self.clock.now_ms();
        Ok(set.entries.iter().any(|(id, at)| {
            id == &lease_id.0 && now.saturating_sub(*at) < REVOCATION_SET_WINDOW_MS
        }))
    }
}

fn lease_created_cert_bound(created_at: u64) -> u64 {
    created_at + MAX_LEASE_MS
}

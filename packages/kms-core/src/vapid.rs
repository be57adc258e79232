//! ES256 JWT construction for Web Push (RFC 8292), JTI anti-replay, and
//! the lease-backed issuance path that needs no fresh authentication.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::audit::{AuditContext, AuditEntry, SignerSel};
use crate::canonical::{b64u, b64u_decode, encode_canonical};
use crate::crypto::{aead_decrypt, der_to_p1363, es256_verify, uuid_v4, Es256Handle};
use crate::error::{KmsError, KmsResult};
use crate::kms::Kms;
use crate::types::{Credential, Endpoint, Kid, LeaseId};
use crate::unlock::OpClass;
use serde_json::{json, Value};
use zeroize::Zeroizing;

/// Hard ceiling on token lifetime.
pub const MAX_TOKEN_TTL_S: u64 = 900;
pub const MAX_BATCH_COUNT: usize = 10;

#[derive(Clone, Debug)]
pub struct IssueVapidJwtRequest {
    pub lease_id: LeaseId,
    pub endpoint: Endpoint,
    pub kid: Option<Kid>,
    /// Request id propagated into the `rid` claim when present.
    pub rid: Option<String>,
    /// Test and replay-injection hook; a fresh UUID v4 when absent.
    pub jti: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IssuedJwt {
    pub jwt: String,
    pub jti: String,
    pub exp_ms: u64,
    pub audit_entry: AuditEntry,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    /// Issue one JWT under a lease. No authentication; authorization is the
    /// lease itself plus quota headroom.
    pub fn issue_vapid_jwt(&mut self, req: IssueVapidJwtRequest) -> KmsResult<IssuedJwt> {
        self.issue_with_times(req, None)
    }

    /// Issue `count` staggered JWTs: token `i` carries
    /// `iat = now + i*stagger` and `exp = iat + ttl`, `stagger = 0.6*ttl`,
    /// so a client can rotate through them without re-contacting the KMS.
    /// Each issuance counts against quotas independently.
    pub fn issue_vapid_jwts(
        &mut self,
        req: IssueVapidJwtRequest,
        count: usize,
    ) -> KmsResult<Vec<IssuedJwt>> {
        if count == 0 || count > MAX_BATCH_COUNT {
            return Err(KmsError::Internal("batch count out of range".to_string()));
        }
        let ttl_s = self.token_ttl_s();
        let stagger_s = ttl_s * 6 / 10;
        let now_s = self.clock.now_ms() / 1000;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let iat_s = now_s + i as u64 * stagger_s;
            let issued = self.issue_with_times(req.clone(), Some(iat_s))?;
            out.push(issued);
        }
        Ok(out)
    }

    fn token_ttl_s(&self) -> u64 {
        self.config.policy.token_ttl_s.min(MAX_TOKEN_TTL_S)
    }

    fn issue_with_times(
        &mut self,
        req: IssueVapidJwtRequest,
        iat_override_s: Option<u64>,
    ) -> KmsResult<IssuedJwt> {
        self.ensure_operational()?;
        let now = self.clock.now_ms();

        if req.endpoint.eid.is_empty() {
            return Err(KmsError::EidUnknown);
        }
        if self.recently_revoked(&req.lease_id)? {
            return Err(KmsError::LeaseRevoked);
        }
        let mut lease = self.load_lease(&req.lease_id)?;
        lease.check_usable(now)?;

        let sub = lease
            .subs
            .iter()
            .find(|s| s.eid == req.endpoint.eid)
            .ok_or(KmsError::EndpointNotInLease)?;
        if sub.aud != req.endpoint.aud {
            return Err(KmsError::AudMismatch);
        }
        let kid = match &req.kid {
            Some(kid) if *kid != lease.kid => {
                return Err(KmsError::ConfigNotFound(format!(
                    "key {} is not bound to the lease",
                    kid.0
                )))
            }
            _ => lease.kid.clone(),
        };

        lease.quota_state.check(&lease.quotas, &req.endpoint.eid, now)?;
        lease.quota_state.in_flight_sends += 1;
        self.save_lease(&lease)?;

        let result = self.sign_lease_jwt(&lease, &req, &kid, iat_override_s, now);

        // The in-flight slot is released on every path; counters only move
        // once the audit entry landed.
        let mut lease = self.load_lease(&req.lease_id)?;
        lease.quota_state.in_flight_sends = lease.quota_state.in_flight_sends.saturating_sub(1);
        if result.is_ok() {
            lease.quota_state.record_issue(&req.endpoint.eid, now);
        }
        lease.updated_at = now;
        self.save_lease(&lease)?;

        result
    }

    fn sign_lease_jwt(
        &mut self,
        lease: &crate::lease::Lease,
        req: &IssueVapidJwtRequest,
        kid: &Kid,
        iat_override_s: Option<u64>,
        now: u64,
    ) -> KmsResult<IssuedJwt> {
        let ttl_s = self.token_ttl_s();
        let jti = req
            .jti
            .clone()
            .unwrap_or_else(|| uuid_v4(&self.entropy));

        // JTI uniqueness over the trailing TTL window; checked against the
        // audit log, and the append below is what commits the jti.
        if self.recent_jtis(ttl_s * 1000)?.contains(&jti) {
            tracing::warn!(lease = %lease.lease_id.0, "jti replay rejected");
            return Err(KmsError::JtiCollision);
        }

        let session_kek = self.session_kek_for(&lease.lease_id)?;
        let raw = Zeroizing::new(aead_decrypt(
            session_kek.as_ref(),
            &b64u_decode(&lease.aad)?,
            &b64u_decode(&lease.iv)?,
            &b64u_decode(&lease.wrapped_lease_key)?,
        )?);
        let handle = Es256Handle::from_raw(&raw)?;

        let iat_s = iat_override_s.unwrap_or(now / 1000);
        let exp_s = iat_s + ttl_s;
        let mut payload = json!({
            "aud": req.endpoint.aud,
            "sub": self.config.contact,
            "iat": iat_s,
            "nbf": iat_s,
            "exp": exp_s,
            "jti": jti,
            "eid": req.endpoint.eid,
        });
        if let Some(rid) = &req.rid {
            payload["rid"] = json!(rid);
        }
        let jwt = sign_es256_jwt(&handle, &kid.0, &payload)?;

        let ctx = AuditContext {
            kid: Some(kid.clone()),
            request_id: req.rid.clone().unwrap_or_else(|| uuid_v4(&self.entropy)),
            lease_id: Some(lease.lease_id.clone()),
            details: Some(json!({
                "endpoint": { "url": req.endpoint.url },
                "aud": req.endpoint.aud,
                "exp": exp_s,
            })),
            jti: Some(jti.clone()),
            ..AuditContext::default()
        };
        let audit_entry =
            self.append_audit("vapid:issue", ctx, SignerSel::Lease(lease.lease_id.clone()))?;
        self.touch_key(kid)?;

        Ok(IssuedJwt {
            jwt,
            jti,
            exp_ms: exp_s * 1000,
            audit_entry,
        })
    }

    /// Sign a caller-shaped payload with a wrapped key, inside an unlock.
    pub fn sign_jwt(
        &mut self,
        kid: &Kid,
        payload: Value,
        credential: &Credential,
    ) -> KmsResult<String> {
        let kid = kid.clone();
        self.with_unlock(credential, OpClass::Sign, move |kms, scope| {
            let record = kms.load_key(&kid)?;
            let handle = kms.unwrap_es256(&record, scope.mkek())?;
            let mut payload = payload;
            validate_jwt_payload(&mut payload, || uuid_v4(&kms.entropy))?;
            let jwt = sign_es256_jwt(&handle, &kid.0, &payload)?;
            let ctx = AuditContext {
                kid: Some(kid.clone()),
                request_id: scope.request_id.clone(),
                jti: payload.get("jti").and_then(|j| j.as_str()).map(String::from),
                ..AuditContext::default()
            };
            let mkek = Zeroizing::new(*scope.mkek());
            kms.append_audit("jwt:sign", ctx, SignerSel::User(mkek))?;
            kms.touch_key(&kid)?;
            Ok(jwt)
        })
    }
}

/// Compose and sign `b64u(header).b64u(payload)` with ES256; the signature
/// segment is exactly 64 P-1363 bytes, converting from DER if a provider
/// ever hands longer output back.
pub fn sign_es256_jwt(handle: &Es256Handle, kid: &str, payload: &Value) -> KmsResult<String> {
    let header = json!({
        "alg": "ES256",
        "typ": "JWT",
        "kid": kid,
    });
    let signing_input = format!(
        "{}.{}",
        b64u(&encode_canonical(&header)?),
        b64u(&encode_canonical(payload)?)
    );
    let raw_sig = handle.sign(signing_input.as_bytes()).to_vec();
    let sig: [u8; 64] = match raw_sig.as_slice().try_into() {
        Ok(sig) => sig,
        Err(_) => der_to_p1363(&raw_sig)?,
    };
    Ok(format!("{signing_input}.{}", b64u(&sig)))
}

/// Required claims for caller-shaped payloads: `aud`, a `mailto:`/`https:`
/// `sub`, `iat`, `exp` with `exp - iat <= 900`, and a `jti` (generated when
/// absent).
fn validate_jwt_payload(
    payload: &mut Value,
    mut fresh_jti: impl FnMut() -> String,
) -> KmsResult<()> {
    let obj = payload
        .as_object()
        .ok_or_else(|| KmsError::Internal("jwt payload must be an object".to_string()))?;
    if obj.get("aud").and_then(|v| v.as_str()).is_none() {
        return Err(KmsError::AudMismatch);
    }
    let sub = obj
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| KmsError::Internal("jwt payload missing sub".to_string()))?;
    if !sub.starts_with("mailto:") && !sub.starts_with("https:") {
        return Err(KmsError::Internal("jwt sub must be mailto: or https:".to_string()));
    }
    let iat = obj.get("iat").and_then(|v| v.as_u64());
    let exp = obj.get("exp").and_then(|v| v.as_u64());
    match (iat, exp) {
        (Some(iat), Some(exp)) if exp > iat && exp - iat <= MAX_TOKEN_TTL_S => {}
        _ => {
            return Err(KmsError::Internal(
                "jwt exp/iat out of bounds".to_string(),
            ))
        }
    }
    if payload.get("jti").and_then(|v| v.as_str()).is_none() {
        payload["jti"] = json!(fresh_jti());
    }
    Ok(())
}

/// Verify an ES256 JWT against a raw uncompressed public key.
pub fn verify_es256_jwt(jwt: &str, pub_raw: &[u8]) -> bool {
    let mut parts = jwt.split('.');
    let (Some(header), Some(payload), Some(sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(sig) = b64u_decode(sig) else {
        return false;
    };
    if sig.len() != 64 {
        return false;
    }
    let signing_input = format!("{header}.{payload}");
    es256_verify(pub_raw, signing_input.as_bytes(), &sig)
}

/// `Authorization: vapid t=<jwt>, k=<base64url(pub)>` header value.
pub fn vapid_authorization_header(jwt: &str, pub_raw: &[u8]) -> String {
    format!("vapid t={jwt}, k={}", b64u(pub_raw))
}

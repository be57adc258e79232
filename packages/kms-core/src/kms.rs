//! The KMS service surface: one struct over the four adapters, exposing
//! the callable operations. Mirrors the store layout one logical key per
//! record; all multi-field records are canonical-JSON serialized.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::audit::{verify_chain, AuditContext, AuditEntry, AuditState, ChainVerification, SignerSel};
use crate::boot::{BootDecision, BootStatus};
use crate::canonical::b64u_decode;
use crate::crypto::{scrub, uuid_v4};
use crate::error::{KmsError, KmsResult};
use crate::kdf::derive_mkek;
use crate::master_secret::{create_master_secret, MsMeta};
use crate::quota::QuotaConfig;
use crate::types::{Credential, EnrollmentId, KeyPurpose, Kid, Method};
use crate::unlock::OpClass;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use zeroize::Zeroizing;

pub(crate) const NAMESPACE: &str = "kms";
const LIST_PAGE: usize = 512;

/// Logical store keys.
pub(crate) mod keys {
    pub const MS_METADATA: &str = "ms:metadata";
    pub const ENROLLMENT_INDEX: &str = "enrollment:index";
    pub const KEY_INDEX: &str = "key:index";
    pub const LEASE_INDEX: &str = "lease:index";
    pub const AUDIT_STATE: &str = "audit:state";
    pub const AUDIT_PUBKEYS: &str = "audit:pubkeys";
    pub const META_LRK: &str = "meta:LRK";
    pub const META_KIAK: &str = "meta:KIAK";
    pub const META_UAK: &str = "meta:UAK";
    pub const REVOKED_LEASES: &str = "revoked-leases";
    pub const GATE_ATTEMPTS: &str = "gate:attempts";

    pub fn enrollment_config(id: &str) -> String {
        format!("enrollment:{id}:config")
    }

    pub fn key(kid: &str) -> String {
        format!("key:{kid}")
    }

    pub fn lease(lease_id: &str) -> String {
        format!("lease:{lease_id}")
    }

    pub fn lease_audit_key(lease_id: &str) -> String {
        format!("lease-audit-key:{lease_id}")
    }

    pub fn audit_entry(seq: u64) -> String {
        format!("audit:{seq}")
    }

    pub fn session_kek(lease_id: &str) -> String {
        format!("meta:sessionkek:{lease_id}")
    }
}

#[derive(Clone, Debug)]
pub struct KmsPolicy {
    /// Default VAPID token lifetime; hard-capped at 900 s.
    pub token_ttl_s: u64,
    pub default_quotas: QuotaConfig,
    /// Skip runtime calibration and pin the PBKDF2 cost. Embedding hook;
    /// production leaves this unset and calibrates per platform.
    pub fixed_pbkdf2_iterations: Option<u32>,
    /// PBKDF2 cost for the backup bundle KEK.
    pub backup_kdf_iterations: u32,
}

impl Default for KmsPolicy {
    fn default() -> Self {
        Self {
            token_ttl_s: 900,
            default_quotas: QuotaConfig::default(),
            fixed_pbkdf2_iterations: None,
            backup_kdf_iterations: 600_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KmsConfig {
    pub policy: KmsPolicy,
    /// Coarse device fingerprint (OS family x browser family x perf tier).
    pub platform_hash: String,
    /// `sub` claim for issued VAPID tokens; `mailto:` or `https:`.
    pub contact: String,
    /// Bound into delegation certificates.
    pub code_hash: String,
    pub manifest_hash: String,
    /// Origin recorded on audit entries when the caller supplies none.
    pub origin: Option<String>,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            policy: KmsPolicy::default(),
            platform_hash: "unknown/unknown/1".to_string(),
            contact: "mailto:push@ats.example".to_string(),
            code_hash: String::new(),
            manifest_hash: String::new(),
            origin: None,
        }
    }
}

pub struct Kms<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> {
    pub(crate) storage: S,
    pub(crate) clock: C,
    pub(crate) entropy: E,
    pub(crate) authenticator: A,
    pub(crate) config: KmsConfig,
    pub(crate) boot: BootStatus,
    pub(crate) lrk: Option<Zeroizing<Vec<u8>>>,
    pub(crate) session_keks: HashMap<String, Zeroizing<Vec<u8>>>,
    pub(crate) pending_unlock_mkek: Option<Zeroizing<[u8; 32]>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupResult {
    pub enrollment_id: EnrollmentId,
    pub vapid_kid: Kid,
    pub vapid_pub_raw: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IsSetup {
    pub is_setup: bool,
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollmentInfo {
    pub id: EnrollmentId,
    pub method: Method,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    pub fn new(storage: S, clock: C, entropy: E, authenticator: A, config: KmsConfig) -> Self {
        Self {
            storage,
            clock,
            entropy,
            authenticator,
            config,
            boot: BootStatus::NotInitialized,
            lrk: None,
            session_keks: HashMap::new(),
            pending_unlock_mkek: None,
        }
    }

    /// Admit the boot verifier's decision. Anything but a satisfied
    /// `operate` quorum leaves the core inert.
    pub fn initialize(&mut self, decision: BootDecision) -> KmsResult<()> {
        match decision {
            BootDecision::FailSecure { reason } => {
                tracing::warn!(%reason, "boot verifier declared fail-secure");
                self.boot = BootStatus::FailSecure;
                Err(KmsError::AttestationFailed)
            }
            BootDecision::Operate(quorum) => {
                if !quorum.satisfied() {
                    tracing::warn!("attestation quorum not satisfied");
                    self.boot = BootStatus::FailSecure;
                    return Err(KmsError::AttestationFailed);
                }
                self.boot = BootStatus::Operational;
                self.ensure_lrk()?;
                let first_boot = self.store_get_raw(keys::META_KIAK)?.is_none();
                let kiak = self.ensure_kiak()?;
                self.register_audit_pubkey(&kiak.pub_key)?;
                let ctx = AuditContext {
                    request_id: uuid_v4(&self.entropy),
                    details: Some(json!({ "first_boot": first_boot })),
                    ..AuditContext::default()
                };
                self.append_audit("boot", ctx, SignerSel::Instance)?;
                tracing::debug!(first_boot, "kms operational");
                Ok(())
            }
        }
    }

    pub(crate) fn ensure_operational(&self) -> KmsResult<()> {
        match self.boot {
            BootStatus::Operational => Ok(()),
            BootStatus::NotInitialized | BootStatus::FailSecure => {
                Err(KmsError::AttestationFailed)
            }
        }
    }

    fn ensure_lrk(&mut self) -> KmsResult<()> {
        if self.lrk.is_some() {
            return Ok(());
        }
        match self.store_get_raw(keys::META_LRK)? {
            Some(raw) => {
                if raw.len() != 32 {
                    return Err(KmsError::ConfigCorrupted("meta:LRK".to_string()));
                }
                self.lrk = Some(Zeroizing::new(raw));
            }
            None => {
                let raw = self.entropy.random_bytes(32);
                self.store_put_raw(keys::META_LRK, &raw)?;
                self.lrk = Some(Zeroizing::new(raw));
            }
        }
        Ok(())
    }

    /// The process-singleton LeaseRootKey; wraps LAK/KIAK only.
    pub(crate) fn lrk_bytes(&self) -> KmsResult<Zeroizing<[u8; 32]>> {
        let lrk = self
            .lrk
            .as_ref()
            .ok_or_else(|| KmsError::Internal("lrk not initialized".to_string()))?;
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(lrk);
        Ok(out)
    }

    // ---- store helpers ----------------------------------------------------

    pub(crate) fn store_get_raw(&self, key: &str) -> KmsResult<Option<Vec<u8>>> {
        self.storage
            .get(NAMESPACE, key)
            .map_err(|e| KmsError::Internal(format!("storage get {key}: {e:?}")))
    }

    pub(crate) fn store_put_raw(&self, key: &str, value: &[u8]) -> KmsResult<()> {
        self.storage
            .put(NAMESPACE, key, value)
            .map_err(|e| KmsError::Internal(format!("storage put {key}: {e:?}")))
    }

    pub(crate) fn store_delete(&self, key: &str) -> KmsResult<()> {
        self.storage
            .delete(NAMESPACE, key)
            .map_err(|e| KmsError::Internal(format!("storage delete {key}: {e:?}")))
    }

    pub(crate) fn store_get_json<T: DeserializeOwned>(&self, key: &str) -> KmsResult<Option<T>> {
        match self.store_get_raw(key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KmsError::ConfigCorrupted(format!("{key}: {e}"))),
        }
    }

    pub(crate) fn store_put_json<T: Serialize>(&self, key: &str, value: &T) -> KmsResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| KmsError::Internal(format!("encode {key}: {e}")))?;
        self.store_put_raw(key, &bytes)
    }

    pub(crate) fn store_list_keys(&self) -> KmsResult<Vec<String>> {
        let mut cursor = String::new();
        let mut out = Vec::new();
        loop {
            let (batch, next) = self
                .storage
                .list_since(NAMESPACE, &cursor, LIST_PAGE)
                .map_err(|e| KmsError::Internal(format!("storage list: {e:?}")))?;
            if batch.is_empty() {
                break;
            }
            for (key, _) in batch {
                out.push(key);
            }
            if next == cursor || next.is_empty() {
                break;
            }
            cursor = next;
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    pub(crate) fn register_audit_pubkey(&self, pub_b64u: &str) -> KmsResult<()> {
        let mut registry = self
            .store_get_json::<BTreeMap<String, String>>(keys::AUDIT_PUBKEYS)?
            .unwrap_or_default();
        let id = crate::crypto::signer_id(&b64u_decode(pub_b64u)?);
        registry.insert(id, pub_b64u.to_string());
        self.store_put_json(keys::AUDIT_PUBKEYS, &registry)
    }

    pub(crate) fn audit_pubkeys(&self) -> KmsResult<BTreeMap<String, String>> {
        Ok(self
            .store_get_json::<BTreeMap<String, String>>(keys::AUDIT_PUBKEYS)?
            .unwrap_or_default())
    }

    // ---- setup ------------------------------------------------------------

    /// First-enrollment setup with a passphrase. Creates the MS, the UAK,
    /// and the initial VAPID key.
    pub fn setup_passphrase(&mut self, passphrase: &str) -> KmsResult<SetupResult> {
        let credential = Credential::Passphrase {
            passphrase: passphrase.to_string(),
        };
        self.setup_with_credential(credential, None, None, None)
    }

    /// First-enrollment setup with a WebAuthn PRF credential; registration
    /// runs through the authenticator collaborator.
    pub fn setup_passkey_prf(
        &mut self,
        name: &str,
        rp_id: &str,
        user_id: &str,
    ) -> KmsResult<SetupResult> {
        let credential_id = self
            .authenticator
            .register(name, rp_id, user_id)
            .map_err(|_| KmsError::UnlockDenied)?;
        let credential = Credential::PasskeyPrf { credential_id };
        self.setup_with_credential(
            credential,
            Some(name.to_string()),
            Some(rp_id.to_string()),
            Some(user_id.to_string()),
        )
    }

    /// Gate-only fallback setup for authenticators without PRF. The
    /// passphrase is combined with a sealed pepper released by the gate
    /// assertion.
    pub fn setup_passkey_gate(
        &mut self,
        name: &str,
        rp_id: &str,
        user_id: &str,
        passphrase: &str,
    ) -> KmsResult<SetupResult> {
        let credential_id = self
            .authenticator
            .register(name, rp_id, user_id)
            .map_err(|_| KmsError::UnlockDenied)?;
        let credential = Credential::PasskeyGate {
            credential_id,
            passphrase: passphrase.to_string(),
        };
        self.setup_with_credential(
            credential,
            Some(name.to_string()),
            Some(rp_id.to_string()),
            Some(user_id.to_string()),
        )
    }

    fn setup_with_credential(
        &mut self,
        credential: Credential,
        name: Option<String>,
        rp_id: Option<String>,
        user_id: Option<String>,
    ) -> KmsResult<SetupResult> {
        self.ensure_operational()?;
        if !self.load_enrollment_index()?.is_empty() {
            return Err(KmsError::Internal("already set up".to_string()));
        }
        let request_id = uuid_v4(&self.entropy);
        let now = self.clock.now_ms();

        let enrollment_id = self.new_enrollment_id();
        let prepared =
            self.prepare_new_kek(&enrollment_id, &credential, rp_id.as_deref(), user_id.as_deref())?;

        let mut ms = create_master_secret(&self.entropy);
        let mut mkek = derive_mkek(&ms)?;

        let result = self.finish_setup(
            prepared,
            credential.method(),
            &ms,
            &mkek,
            enrollment_id,
            name,
            rp_id,
            user_id,
            &request_id,
            now,
        );

        scrub(&self.entropy, &mut ms[..]);
        scrub(&self.entropy, &mut mkek[..]);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_setup(
        &mut self,
        prepared: crate::master_secret::PreparedKek,
        method: Method,
        ms: &Zeroizing<[u8; 32]>,
        mkek: &Zeroizing<[u8; 32]>,
        enrollment_id: EnrollmentId,
        name: Option<String>,
        rp_id: Option<String>,
        user_id: Option<String>,
        request_id: &str,
        now: u64,
    ) -> KmsResult<SetupResult> {
        let uak_ref = self.generate_uak(mkek)?;
        self.register_audit_pubkey(&uak_ref.pub_key)?;

        let enrollment = self.persist_enrollment(
            prepared,
            method,
            ms,
            1,
            name,
            rp_id,
            user_id,
            enrollment_id,
        )?;
        self.save_ms_meta(&MsMeta {
            ms_version: 1,
            created_at: now,
            updated_at: now,
        })?;

        let vapid = self.wrap_new_es256(KeyPurpose::Vapid, mkek)?;

        let ctx = AuditContext {
            kid: Some(vapid.kid.clone()),
            request_id: request_id.to_string(),
            details: Some(json!({
                "method": method.as_str(),
                "enrollment_id": enrollment.id.0,
            })),
            ..AuditContext::default()
        };
        let mkek_copy = Zeroizing::new(**mkek);
        self.append_audit("setup", ctx, SignerSel::User(mkek_copy))?;
        tracing::debug!(method = method.as_str(), "first enrollment complete");

        Ok(SetupResult {
            enrollment_id: enrollment.id,
            vapid_kid: vapid.kid,
            vapid_pub_raw: b64u_decode(&vapid.public_key_raw)?,
        })
    }

    // ---- enrollment management --------------------------------------------

    /// Bind an additional credential to the existing MS.
    pub fn add_enrollment(
        &mut self,
        current: &Credential,
        new_credential: Credential,
        name: Option<String>,
        rp_id: Option<String>,
        user_id: Option<String>,
    ) -> KmsResult<EnrollmentId> {
        self.with_unlock(current, OpClass::Default, move |kms, scope| {
            let enrollment_id = kms.new_enrollment_id();
            let prepared = kms.prepare_new_kek(
                &enrollment_id,
                &new_credential,
                rp_id.as_deref(),
                user_id.as_deref(),
            )?;
            let meta = kms.load_ms_meta()?;
            let enrollment = kms.persist_enrollment(
                prepared,
                new_credential.method(),
                scope.ms(),
                meta.ms_version,
                name,
                rp_id,
                user_id,
                enrollment_id,
            )?;
            let ctx = AuditContext {
                request_id: scope.request_id.clone(),
                details: Some(json!({
                    "enrollment_id": enrollment.id.0,
                    "method": enrollment.method.as_str(),
                })),
                ..AuditContext::default()
            };
            let mkek = Zeroizing::new(*scope.mkek());
            kms.append_audit("enrollment:add", ctx, SignerSel::User(mkek))?;
            Ok(enrollment.id)
        })
    }

    /// Remove a credential; refuses to orphan the MS.
    pub fn remove_enrollment(
        &mut self,
        enrollment_id: &EnrollmentId,
        credential: &Credential,
    ) -> KmsResult<()> {
        let enrollment_id = enrollment_id.clone();
        self.with_unlock(credential, OpClass::Default, move |kms, scope| {
            let index = kms.load_enrollment_index()?;
            if !index.iter().any(|e| e.id == enrollment_id) {
                return Err(KmsError::ConfigNotFound(format!(
                    "enrollment:{}",
                    enrollment_id.0
                )));
            }
            if index.len() <= 1 {
                return Err(KmsError::Internal(
                    "cannot remove the last enrollment".to_string(),
                ));
            }
            kms.store_delete(&keys::enrollment_config(&enrollment_id.0))?;
            let remaining: Vec<_> =
                index.into_iter().filter(|e| e.id != enrollment_id).collect();
            kms.save_enrollment_index(&remaining)?;
            let ctx = AuditContext {
                request_id: scope.request_id.clone(),
                details: Some(json!({ "enrollment_id": enrollment_id.0 })),
                ..AuditContext::default()
            };
            let mkek = Zeroizing::new(*scope.mkek());
            kms.append_audit("enrollment:remove", ctx, SignerSel::User(mkek))?;
            Ok(())
        })
    }

    /// Re-wrap the MS for the authenticated passphrase enrollment under a
    /// freshly calibrated KDF and a new passphrase.
    pub fn change_passphrase(&mut self, current: &str, new_passphrase: &str) -> KmsResult<()> {
        if new_passphrase.len() < 8 {
            return Err(KmsError::UnlockDenied);
        }
        let credential = Credential::Passphrase {
            passphrase: current.to_string(),
        };
        let new_credential = Credential::Passphrase {
            passphrase: new_passphrase.to_string(),
        };
        self.with_unlock(&credential, OpClass::Default, move |kms, scope| {
            let enrollment = kms.load_enrollment(&scope.enrollment_id)?;
            let prepared =
                kms.prepare_new_kek(&enrollment.id, &new_credential, None, None)?;
            let mut meta = kms.load_ms_meta()?;
            meta.ms_version += 1;
            meta.updated_at = kms.clock.now_ms();
            let mut refreshed = kms.persist_enrollment(
                prepared,
                Method::Passphrase,
                scope.ms(),
                meta.ms_version,
                enrollment.name.clone(),
                enrollment.rp_id.clone(),
                enrollment.user_id.clone(),
                enrollment.id.clone(),
            )?;
            refreshed.created_at = enrollment.created_at;
            kms.save_enrollment(&refreshed)?;
            kms.save_ms_meta(&meta)?;
            let ctx = AuditContext {
                request_id: scope.request_id.clone(),
                details: Some(json!({
                    "enrollment_id": enrollment.id.0,
                    "ms_version": meta.ms_version,
                })),
                ..AuditContext::default()
            };
            let mkek = Zeroizing::new(*scope.mkek());
            kms.append_audit("enrollment:update", ctx, SignerSel::User(mkek))?;
            Ok(())
        })
    }

    // ---- keys -------------------------------------------------------------

    /// Generate an additional VAPID keypair.
    pub fn generate_vapid(&mut self, credential: &Credential) -> KmsResult<(Kid, Vec<u8>)> {
        self.with_unlock(credential, OpClass::Generate, |kms, scope| {
            let record = kms.wrap_new_es256(KeyPurpose::Vapid, scope.mkek())?;
            let ctx = AuditContext {
                kid: Some(record.kid.clone()),
                request_id: scope.request_id.clone(),
                ..AuditContext::default()
            };
            let mkek = Zeroizing::new(*scope.mkek());
            kms.append_audit("key:generate", ctx, SignerSel::User(mkek))?;
            Ok((record.kid.clone(), b64u_decode(&record.public_key_raw)?))
        })
    }

    /// Public half of a wrapped key; no authentication required.
    pub fn get_public_key(&self, kid: &Kid) -> KmsResult<Vec<u8>> {
        self.ensure_operational()?;
        let record = self.load_key(kid)?;
        b64u_decode(&record.public_key_raw)
    }

    // ---- introspection ----------------------------------------------------

    pub fn is_setup(&self) -> KmsResult<IsSetup> {
        self.ensure_operational()?;
        let index = self.load_enrollment_index()?;
        let mut methods: Vec<String> = index
            .iter()
            .map(|e| e.method.coarse().to_string())
            .collect();
        methods.sort();
        methods.dedup();
        Ok(IsSetup {
            is_setup: !index.is_empty(),
            methods,
        })
    }

    pub fn get_enrollments(&self) -> KmsResult<Vec<EnrollmentInfo>> {
        self.ensure_operational()?;
        self.load_enrollment_index()?
            .iter()
            .map(|summary| {
                let config = self.load_enrollment(&summary.id)?;
                Ok(EnrollmentInfo {
                    id: config.id,
                    method: config.method,
                    created_at: config.created_at,
                    updated_at: config.updated_at,
                    name: config.name,
                })
            })
            .collect()
    }

    // ---- audit surface ----------------------------------------------------

    pub fn get_audit_log(
        &self,
        from_seq: u64,
        limit: Option<usize>,
    ) -> KmsResult<Vec<AuditEntry>> {
        self.ensure_operational()?;
        self.collect_audit_entries(from_seq, limit)
    }

    pub fn get_audit_state(&self) -> KmsResult<AuditState> {
        self.ensure_operational()?;
        self.load_audit_state()
    }

    /// The UAK public key, base64url.
    pub fn get_audit_public_key(&self) -> KmsResult<String> {
        self.ensure_operational()?;
        Ok(self.load_uak_ref()?.pub_key)
    }

    /// Verify the full chain from genesis using the locally known UAK and
    /// the genesis KIAK public key.
    pub fn verify_audit_chain(&self) -> KmsResult<ChainVerification> {
        self.ensure_operational()?;
        let entries = self.collect_audit_entries(0, None)?;
        let uak_pub = match self.store_get_json::<crate::delegation::UakRef>(keys::META_UAK)? {
            Some(uak) => Some(b64u_decode(&uak.pub_key)?),
            None => None,
        };
        let registry = self.audit_pubkeys()?;
        let genesis_kiak = entries
            .first()
            .and_then(|entry| registry.get(&entry.signer_id))
            .map(|pub_b64u| b64u_decode(pub_b64u))
            .transpose()?
            .or_else(|| {
                self.store_get_json::<crate::delegation::KiakRecord>(keys::META_KIAK)
                    .ok()
                    .flatten()
                    .and_then(|record| b64u_decode(&record.pub_key).ok())
            })
            .ok_or_else(|| KmsError::ConfigNotFound("meta:KIAK".to_string()))?;
        let report = verify_chain(&entries, uak_pub.as_deref(), &genesis_kiak);
        if !report.valid {
            tracing::warn!(errors = report.errors.len(), "audit chain verification failed");
        }
        Ok(report)
    }

    /// Rotate the KIAK under user authority; emits the dual-signed
    /// `audit:rotate` entry and certifies the replacement.
    pub fn rotate_instance_audit_key(&mut self, credential: &Credential) -> KmsResult<()> {
        self.with_unlock(credential, OpClass::Default, |kms, scope| {
            let record = kms.rotate_kiak(scope.mkek())?;
            kms.register_audit_pubkey(&record.pub_key)?;
            Ok(())
        })
    }

    // ---- reset ------------------------------------------------------------

    /// Destructive: wipe the store, reinitialize the LRK and KIAK, restart
    /// the audit chain with a fresh boot entry.
    pub fn reset(&mut self) -> KmsResult<()> {
        self.ensure_operational()?;
        tracing::warn!("resetting kms store");
        for key in self.store_list_keys()? {
            self.store_delete(&key)?;
        }
        self.session_keks.clear();
        self.lrk = None;
        self.pending_unlock_mkek = None;

        self.ensure_lrk()?;
        let kiak = self.ensure_kiak()?;
        self.register_audit_pubkey(&kiak.pub_key)?;
        let ctx = AuditContext {
            request_id: uuid_v4(&self.entropy),
            details: Some(json!({ "first_boot": true, "reset": true })),
            ..AuditContext::default()
        };
        self.append_audit("boot", ctx, SignerSel::Instance)?;
        Ok(())
    }
}


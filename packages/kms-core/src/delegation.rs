//! Three-tier audit signer delegation. The UAK is generated once and
//! wrapped under the MKEK; the KIAK on first boot and each LAK per lease,
//! both wrapped under the process-singleton LeaseRootKey. LAK and KIAK act
//! under UAK-signed delegation certificates.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::canonical::{aad_root_wrap, b64u, b64u_decode, encode_canonical, KMS_VERSION};
use crate::crypto::{aead_decrypt, aead_encrypt, ed25519_generate, ed25519_verify, Ed25519Handle};
use crate::error::{KmsError, KmsResult};
use crate::kms::{keys, Kms};
use crate::types::{InstanceId, KeyPurpose, Kid, LeaseId, SignerKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

pub const CERT_TYPE: &str = "audit-delegation";
pub const CERT_VERSION: u64 = 1;

/// Scope granted to every lease audit key. The `lease:*` wildcard covers
/// the lifecycle entries a LAK signs without fresh user authentication
/// (expire, revoke, extend).
pub const LAK_SCOPE: &[&str] = &["vapid:issue", "lease:*"];
const KIAK_SCOPE: &[&str] = &["*"];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegationCertificate {
    #[serde(rename = "type")]
    pub cert_type: String,
    pub version: u64,
    pub signer_kind: SignerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub delegate_pub: String,
    pub scope: Vec<String>,
    pub not_before: u64,
    /// `None` serializes as JSON null: open-ended, KIAK only.
    pub not_after: Option<u64>,
    pub code_hash: String,
    pub manifest_hash: String,
    pub kms_version: u64,
    pub sig: String,
}

impl DelegationCertificate {
    /// Canonical signing input: the certificate minus `sig`.
    pub fn signing_bytes(&self) -> KmsResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| KmsError::Internal(format!("cert encode: {e}")))?;
        if let Value::Object(map) = &mut value {
            map.remove("sig");
        }
        encode_canonical(&value)
    }

    pub fn verify(&self, uak_pub: &[u8]) -> bool {
        let Ok(bytes) = self.signing_bytes() else {
            return false;
        };
        let Ok(sig) = b64u_decode(&self.sig) else {
            return false;
        };
        ed25519_verify(uak_pub, &bytes, &sig)
    }

    pub fn covers(&self, op: &str) -> bool {
        scope_covers(&self.scope, op)
    }

    pub fn valid_at(&self, timestamp_ms: u64) -> bool {
        if timestamp_ms < self.not_before {
            return false;
        }
        match self.not_after {
            Some(not_after) => timestamp_ms <= not_after,
            None => true,
        }
    }
}

/// Strict string membership, except a trailing `*` matches any suffix.
pub fn scope_covers(scope: &[String], op: &str) -> bool {
    scope.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix('*') {
            op.starts_with(prefix)
        } else {
            pattern == op
        }
    })
}

/// Key Instance Audit Key record, persisted at `meta:KIAK`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KiakRecord {
    pub instance_id: InstanceId,
    pub pub_key: String,
    pub wrapped_priv: String,
    pub iv: String,
    pub aad: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<DelegationCertificate>,
    pub created_at: u64,
}

/// Lease Audit Key record, persisted at `lease-audit-key:{lease_id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LakRecord {
    pub lease_id: LeaseId,
    pub pub_key: String,
    pub wrapped_priv: String,
    pub iv: String,
    pub aad: String,
    pub cert: DelegationCertificate,
    pub created_at: u64,
}

/// Pointer to the wrapped UAK, persisted at `meta:UAK`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UakRef {
    pub kid: Kid,
    pub pub_key: String,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    pub(crate) fn load_kiak(&self) -> KmsResult<KiakRecord> {
        self.store_get_json::<KiakRecord>(keys::META_KIAK)?
            .ok_or_else(|| KmsError::ConfigNotFound("meta:KIAK".to_string()))
    }

    /// First-boot KIAK generation; subsequent boots load the existing key.
    pub(crate) fn ensure_kiak(&mut self) -> KmsResult<KiakRecord> {
        if let Some(record) = self.store_get_json::<KiakRecord>(keys::META_KIAK)? {
            return Ok(record);
        }
        let record = self.generate_kiak_record(None)?;
        Ok(record)
    }

    fn generate_kiak_record(
        &mut self,
        cert: Option<DelegationCertificate>,
    ) -> KmsResult<KiakRecord> {
        let instance_id = InstanceId(crate::crypto::uuid_v4(&self.entropy));
        let (handle, raw) = ed25519_generate(&self.entropy)?;
        let lrk = self.lrk_bytes()?;
        let aad = aad_root_wrap("instance-audit-key", &instance_id.0)?;
        let iv = self.entropy.random_bytes(12);
        let wrapped = aead_encrypt(lrk.as_ref(), &aad, &raw, &iv)?;
        drop(raw);
        let record = KiakRecord {
            instance_id,
            pub_key: b64u(&handle.public_bytes()),
            wrapped_priv: b64u(&wrapped),
            iv: b64u(&iv),
            aad: b64u(&aad),
            cert,
            created_at: self.clock.now_ms(),
        };
        self.store_put_json(keys::META_KIAK, &record)?;
        Ok(record)
    }

    pub(crate) fn unwrap_kiak(&mut self, record: &KiakRecord) -> KmsResult<Ed25519Handle> {
        let lrk = self.lrk_bytes()?;
        let raw = Zeroizing::new(aead_decrypt(
            lrk.as_ref(),
            &b64u_decode(&record.aad)?,
            &b64u_decode(&record.iv)?,
            &b64u_decode(&record.wrapped_priv)?,
        )?);
        Ed25519Handle::from_raw(&raw)
    }

    pub(crate) fn uak_exists(&self) -> bool {
        matches!(
            self.store_get_json::<UakRef>(keys::META_UAK),
            Ok(Some(_))
        )
    }

    pub(crate) fn load_uak_ref(&self) -> KmsResult<UakRef> {
        self.store_get_json::<UakRef>(keys::META_UAK)?
            .ok_or_else(|| KmsError::ConfigNotFound("meta:UAK".to_string()))
    }

    /// Generate the UAK during first enrollment, wrapped under the MKEK,
    /// and issue the boot-time KIAK its delegation certificate.
    pub(crate) fn generate_uak(&mut self, mkek: &[u8; 32]) -> KmsResult<UakRef> {
        let record = self.wrap_new_ed25519(KeyPurpose::AuditUser, mkek)?;
        let uak_ref = UakRef {
            kid: record.kid.clone(),
            pub_key: record.public_key_raw.clone(),
        };
        self.store_put_json(keys::META_UAK, &uak_ref)?;

        let mut kiak = self.load_kiak()?;
        let cert = self.issue_cert(
            mkek,
            SignerKind::Kiak,
            None,
            Some(kiak.instance_id.0.clone()),
            &kiak.pub_key,
            KIAK_SCOPE.iter().map(|s| s.to_string()).collect(),
            self.clock.now_ms(),
            None,
        )?;
        kiak.cert = Some(cert);
        self.store_put_json(keys::META_KIAK, &kiak)?;
        Ok(uak_ref)
    }

    pub(crate) fn sign_with_uak(&self, mkek: &[u8; 32], msg: &[u8]) -> KmsResult<[u8; 64]> {
        let uak_ref = self.load_uak_ref()?;
        let record = self.load_key(&uak_ref.kid)?;
        let handle = self.unwrap_ed25519(&record, mkek)?;
        Ok(handle.sign(msg))
    }

    /// UAK-sign a delegation certificate.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn issue_cert(
        &mut self,
        mkek: &[u8; 32],
        signer_kind: SignerKind,
        lease_id: Option<String>,
        instance_id: Option<String>,
        delegate_pub: &str,
        scope: Vec<String>,
        not_before: u64,
        not_after: Option<u64>,
    ) -> KmsResult<DelegationCertificate> {
        let mut cert = DelegationCertificate {
            cert_type: CERT_TYPE.to_string(),
            version: CERT_VERSION,
            signer_kind,
            lease_id,
            instance_id,
            delegate_pub: delegate_pub.to_string(),
            scope,
            not_before,
            not_after,
            code_hash: self.config.code_hash.clone(),
            manifest_hash: self.config.manifest_hash.clone(),
            kms_version: KMS_VERSION,
            sig: String::new(),
        };
        let bytes = cert.signing_bytes()?;
        cert.sig = b64u(&self.sign_with_uak(mkek, &bytes)?);
        Ok(cert)
    }

    /// Generate the lease audit key: an Ed25519 pair wrapped under the LRK
    /// with a UAK-signed certificate bounded by the lease lifetime.
    pub(crate) fn issue_lak(
        &mut self,
        mkek: &[u8; 32],
        lease_id: &LeaseId,
        lease_exp_ms: u64,
    ) -> KmsResult<LakRecord> {
        let (handle, raw) = ed25519_generate(&self.entropy)?;
        let lrk = self.lrk_bytes()?;
        let aad = aad_root_wrap("lease-audit-key", &lease_id.0)?;
        let iv = self.entropy.random_bytes(12);
        let wrapped = aead_encrypt(lrk.as_ref(), &aad, &raw, &iv)?;
        drop(raw);
        let pub_key = b64u(&handle.public_bytes());
        let now = self.clock.now_ms();
        let cert = self.issue_cert(
            mkek,
            SignerKind::Lak,
            Some(lease_id.0.clone()),
            None,
            &pub_key,
            LAK_SCOPE.iter().map(|s| s.to_string()).collect(),
            now,
            Some(lease_exp_ms),
        )?;
        let record = LakRecord {
            lease_id: lease_id.clone(),
            pub_key,
            wrapped_priv: b64u(&wrapped),
            iv: b64u(&iv),
            aad: b64u(&aad),
            cert,
            created_at: now,
        };
        self.store_put_json(&keys::lease_audit_key(&lease_id.0), &record)?;
        Ok(record)
    }

    pub(crate) fn load_lak(&self, lease_id: &LeaseId) -> KmsResult<LakRecord> {
        self.store_get_json::<LakRecord>(&keys::lease_audit_key(&lease_id.0))?
            .ok_or_else(|| KmsError::ConfigNotFound(format!("lease-audit-key:{}", lease_id.0)))
    }

    pub(crate) fn unwrap_lak(&mut self, record: &LakRecord) -> KmsResult<Ed25519Handle> {
        let lrk = self.lrk_bytes()?;
        let raw = Zeroizing::new(aead_decrypt(
            lrk.as_ref(),
            &b64u_decode(&record.aad)?,
            &b64u_decode(&record.iv)?,
            &b64u_decode(&record.wrapped_priv)?,
        )?);
        Ed25519Handle::from_raw(&raw)
    }

    /// KIAK rotation: generate the new key, append an `audit:rotate` entry
    /// carrying signatures under both keys, then certify the new key.
    pub(crate) fn rotate_kiak(&mut self, mkek: &[u8; 32]) -> KmsResult<KiakRecord> {
        let old = self.load_kiak()?;
        let old_handle = self.unwrap_kiak(&old)?;
        let (new_handle, new_raw) = ed25519_generate(&self.entropy)?;
        let new_pub = b64u(&new_handle.public_bytes());

        self.append_rotation_entry(&old, &old_handle, &new_handle, &new_pub)?;

        let instance_id = InstanceId(crate::crypto::uuid_v4(&self.entropy));
        let lrk = self.lrk_bytes()?;
        let aad = aad_root_wrap("instance-audit-key", &instance_id.0)?;
        let iv = self.entropy.random_bytes(12);
        let wrapped = aead_encrypt(lrk.as_ref(), &aad, &new_raw, &iv)?;
        drop(new_raw);
        let cert = self.issue_cert(
            mkek,
            SignerKind::Kiak,
            None,
            Some(instance_id.0.clone()),
            &new_pub,
            KIAK_SCOPE.iter().map(|s| s.to_string()).collect(),
            self.clock.now_ms(),
            None,
        )?;
        let record = KiakRecord {
            instance_id,
            pub_key: new_pub,
            wrapped_priv: b64u(&wrapped),
            iv: b64u(&iv),
            aad: b64u(&aad),
            cert: Some(cert),
            created_at: self.clock.now_ms(),
        };
        self.store_put_json(keys::META_KIAK, &record)?;
        tracing::debug!("instance audit key rotated");
        Ok(record)
    }
}

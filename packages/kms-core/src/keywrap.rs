//! Application-key wrapping under the MKEK. Wrap: generate with a
//! temporary export window, export raw, AEAD-wrap with the canonical
//! wrapped-key AAD, drop the exportable bytes. Unwrap: AEAD-unwrap with the
//! persisted AAD and re-import as a handle restricted to signing.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::canonical::{aad_wrapped_key, b64u, b64u_decode};
use crate::crypto::{
    aead_decrypt, aead_encrypt, ed25519_generate, ed25519_thumbprint_from_raw, es256_generate,
    Ed25519Handle, Es256Handle,
};
use crate::error::{KmsError, KmsResult};
use crate::kms::{keys, Kms};
use crate::types::{KeyAlg, KeyPurpose, Kid};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrappedApplicationKey {
    pub kid: Kid,
    pub purpose: KeyPurpose,
    pub alg: KeyAlg,
    pub wrapped_bytes: String,
    pub iv: String,
    pub aad: String,
    pub public_key_raw: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeySummary {
    pub kid: Kid,
    pub purpose: KeyPurpose,
    pub alg: KeyAlg,
    pub created_at: u64,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    pub(crate) fn load_key(&self, kid: &Kid) -> KmsResult<WrappedApplicationKey> {
        self.store_get_json::<WrappedApplicationKey>(&keys::key(&kid.0))?
            .ok_or_else(|| KmsError::ConfigNotFound(format!("key:{}", kid.0)))
    }

    pub(crate) fn save_key(&self, record: &WrappedApplicationKey) -> KmsResult<()> {
        self.store_put_json(&keys::key(&record.kid.0), record)?;
        let mut index = self.load_key_index()?;
        if !index.iter().any(|entry| entry.kid == record.kid) {
            index.push(KeySummary {
                kid: record.kid.clone(),
                purpose: record.purpose,
                alg: record.alg,
                created_at: record.created_at,
            });
            self.store_put_json(keys::KEY_INDEX, &index)?;
        }
        Ok(())
    }

    pub(crate) fn load_key_index(&self) -> KmsResult<Vec<KeySummary>> {
        Ok(self
            .store_get_json::<Vec<KeySummary>>(keys::KEY_INDEX)?
            .unwrap_or_default())
    }

    /// Most recently created VAPID key; the default for new leases.
    pub(crate) fn latest_vapid_kid(&self) -> KmsResult<Kid> {
        self.load_key_index()?
            .into_iter()
            .filter(|entry| entry.purpose == KeyPurpose::Vapid)
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.kid)
            .ok_or_else(|| KmsError::ConfigNotFound("no vapid key".to_string()))
    }

    /// Generate a P-256 key and persist it wrapped under the MKEK.
    pub(crate) fn wrap_new_es256(
        &mut self,
        purpose: KeyPurpose,
        mkek: &[u8; 32],
    ) -> KmsResult<WrappedApplicationKey> {
        let (handle, raw) = es256_generate(&self.entropy)?;
        let kid = Kid(handle.thumbprint()?);
        let public_key_raw = handle.public_uncompressed();
        let record =
            self.wrap_raw_key(kid, KeyAlg::Es256, purpose, &raw, &public_key_raw, mkek)?;
        drop(raw);
        Ok(record)
    }

    /// Generate an Ed25519 key and persist it wrapped under the MKEK
    /// (used for the User Audit Key).
    pub(crate) fn wrap_new_ed25519(
        &mut self,
        purpose: KeyPurpose,
        mkek: &[u8; 32],
    ) -> KmsResult<WrappedApplicationKey> {
        let (handle, raw) = ed25519_generate(&self.entropy)?;
        let public = handle.public_bytes();
        let kid = Kid(ed25519_thumbprint_from_raw(&public)?);
        let record = self.wrap_raw_key(kid, KeyAlg::EdDsa, purpose, &raw, &public, mkek)?;
        drop(raw);
        Ok(record)
    }

    fn wrap_raw_key(
        &mut self,
        kid: Kid,
        alg: KeyAlg,
        purpose: KeyPurpose,
        raw: &[u8],
        public_key_raw: &[u8],
        mkek: &[u8; 32],
    ) -> KmsResult<WrappedApplicationKey> {
        let created_at = self.clock.now_ms();
        let aad = aad_wrapped_key(&kid.0, alg.as_str(), purpose.as_str(), created_at)?;
        let iv = self.entropy.random_bytes(12);
        let wrapped = aead_encrypt(mkek, &aad, raw, &iv)?;
        let record = WrappedApplicationKey {
            kid,
            purpose,
            alg,
            wrapped_bytes: b64u(&wrapped),
            iv: b64u(&iv),
            aad: b64u(&aad),
            public_key_raw: b64u(public_key_raw),
            created_at,
            last_used_at: None,
        };
        self.save_key(&record)?;
        Ok(record)
    }

    /// Unwrap a P-256 key under the MKEK. The persisted AAD is used
    /// bytewise; any drift is fatal. The returned handle signs only.
    pub(crate) fn unwrap_es256(
        &self,
        record: &WrappedApplicationKey,
        mkek: &[u8; 32],
    ) -> KmsResult<Es256Handle> {
        if record.alg != KeyAlg::Es256 {
            return Err(KmsError::ConfigCorrupted("key alg mismatch".to_string()));
        }
        let raw = Zeroizing::new(self.unwrap_raw(record, mkek)?);
        Es256Handle::from_raw(&raw)
    }

    pub(crate) fn unwrap_ed25519(
        &self,
        record: &WrappedApplicationKey,
        mkek: &[u8; 32],
    ) -> KmsResult<Ed25519Handle> {
        if record.alg != KeyAlg::EdDsa {
            return Err(KmsError::ConfigCorrupted("key alg mismatch".to_string()));
        }
        let raw = Zeroizing::new(self.unwrap_raw(record, mkek)?);
        Ed25519Handle::from_raw(&raw)
    }

    pub(crate) fn unwrap_raw(
        &self,
        record: &WrappedApplicationKey,
        mkek: &[u8; 32],
    ) -> KmsResult<Vec<u8>> {
        aead_decrypt(
            mkek,
            &b64u_decode(&record.aad)?,
            &b64u_decode(&record.iv)?,
            &b64u_decode(&record.wrapped_bytes)?,
        )
    }

    pub(crate) fn touch_key(&self, kid: &Kid) -> KmsResult<()> {
        let mut record = self.load_key(kid)?;
        record.last_used_at = Some(self.clock.now_ms());
        self.store_put_json(&keys::key(&kid.0), &record)
    }
}

//! Master-secret lifecycle: creation, AEAD wrap/unwrap under per-credential
//! KEKs, and multi-enrollment management. The MS itself exists only inside
//! an unlock scope; this module never persists it in clear.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::canonical::{aad_ms_wrap, aad_pepper_gate, b64u, b64u_decode};
use crate::crypto::{aead_decrypt, aead_encrypt, scrub, uuid_v4};
use crate::error::{KmsError, KmsResult};
use crate::kdf::{
    calibrate_pbkdf2, derive_kek_pbkdf2, derive_kek_prf, derive_pepper_key, encode_salt,
    kcv_matches, prf_salt_for, KdfParams,
};
use crate::kms::{keys, Kms};
use crate::types::{Credential, EnrollmentId, Method};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const MS_LEN: usize = 32;
const GATE_ATTEMPT_WINDOW_MS: u64 = 60 * 60 * 1000;
const GATE_ATTEMPT_LIMIT: usize = 20;
const PEPPER_ITERATIONS: u32 = 100_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MsMeta {
    pub ms_version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One record per credential bound to the MS. All byte fields base64url.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollmentConfig {
    pub id: EnrollmentId,
    pub method: Method,
    pub kdf_params: KdfParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kcv: Option<String>,
    pub encrypted_ms: String,
    pub iv: String,
    pub aad: String,
    pub ms_version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub platform_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rp_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollmentSummary {
    pub id: EnrollmentId,
    pub method: Method,
    pub created_at: u64,
}

/// Fresh 32-byte master secret.
pub fn create_master_secret<E: EntropyAdapter>(entropy: &E) -> Zeroizing<[u8; 32]> {
    let bytes = entropy.random_bytes(MS_LEN);
    let mut ms = Zeroizing::new([0u8; 32]);
    ms.copy_from_slice(&bytes);
    ms
}

/// AES-256-GCM wrap of the MS: 48-byte ciphertext (incl. 16-byte tag) and a
/// fresh 12-byte CSRNG iv.
pub fn encrypt_ms<E: EntropyAdapter>(
    entropy: &E,
    ms: &[u8; 32],
    kek: &[u8; 32],
    aad: &[u8],
) -> KmsResult<(Vec<u8>, [u8; 12])> {
    let iv_bytes = entropy.random_bytes(12);
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_bytes);
    let ct = aead_encrypt(kek, aad, ms, &iv)?;
    Ok((ct, iv))
}

/// Unwrap; any tag or AAD failure surfaces as `aad.mismatch`.
pub fn decrypt_ms(
    ct: &[u8],
    kek: &[u8; 32],
    iv: &[u8],
    aad: &[u8],
) -> KmsResult<Zeroizing<[u8; 32]>> {
    let plain = aead_decrypt(kek, aad, iv, ct)?;
    if plain.len() != MS_LEN {
        return Err(KmsError::ConfigCorrupted("master secret length".to_string()));
    }
    let mut ms = Zeroizing::new([0u8; 32]);
    ms.copy_from_slice(&plain);
    Ok(ms)
}

/// Material produced while preparing a new enrollment, before the MS wrap.
pub struct PreparedKek {
    pub kek: Zeroizing<[u8; 32]>,
    pub kcv: Option<String>,
    pub kdf_params: KdfParams,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
struct GateAttempts {
    attempts: Vec<u64>,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    pub(crate) fn load_ms_meta(&self) -> KmsResult<MsMeta> {
        self.store_get_json::<MsMeta>(keys::MS_METADATA)?
            .ok_or_else(|| KmsError::ConfigNotFound("ms:metadata".to_string()))
    }

    pub(crate) fn save_ms_meta(&self, meta: &MsMeta) -> KmsResult<()> {
        self.store_put_json(keys::MS_METADATA, meta)
    }

    pub(crate) fn load_enrollment_index(&self) -> KmsResult<Vec<EnrollmentSummary>> {
        Ok(self
            .store_get_json::<Vec<EnrollmentSummary>>(keys::ENROLLMENT_INDEX)?
            .unwrap_or_default())
    }

    pub(crate) fn save_enrollment_index(&self, index: &[EnrollmentSummary]) -> KmsResult<()> {
        self.store_put_json(keys::ENROLLMENT_INDEX, &index.to_vec())
    }

    pub(crate) fn load_enrollment(&self, id: &EnrollmentId) -> KmsResult<EnrollmentConfig> {
        self.store_get_json::<EnrollmentConfig>(&keys::enrollment_config(&id.0))?
            .ok_or_else(|| KmsError::ConfigNotFound(format!("enrollment:{}", id.0)))
    }

    pub(crate) fn save_enrollment(&self, config: &EnrollmentConfig) -> KmsResult<()> {
        self.store_put_json(&keys::enrollment_config(&config.id.0), config)?;
        let mut index = self.load_enrollment_index()?;
        if let Some(entry) = index.iter_mut().find(|e| e.id == config.id) {
            entry.method = config.method;
            entry.created_at = config.created_at;
        } else {
            index.push(EnrollmentSummary {
                id: config.id.clone(),
                method: config.method,
                created_at: config.created_at,
            });
        }
        self.save_enrollment_index(&index)
    }

    /// Prepare KEK material for a brand-new enrollment of `credential`,
    /// calibrating KDF parameters and sealing gate peppers as needed.
    pub(crate) fn prepare_new_kek(
        &mut self,
        enrollment_id: &EnrollmentId,
        credential: &Credential,
        rp_id: Option<&str>,
        user_id: Option<&str>,
    ) -> KmsResult<PreparedKek> {
        match credential {
            Credential::Passphrase { passphrase } => {
                if passphrase.len() < 8 {
                    return Err(KmsError::UnlockDenied);
                }
                let calibration = self.calibration();
                let derived = derive_kek_pbkdf2(
                    &self.entropy,
                    passphrase.as_bytes(),
                    &calibration.salt,
                    calibration.iterations,
                );
                Ok(PreparedKek {
                    kek: derived.kek,
                    kcv: derived.kcv.map(|k| b64u(&k)),
                    kdf_params: KdfParams::Pbkdf2 {
                        iterations: calibration.iterations,
                        salt: encode_salt(&calibration.salt),
                        last_calibrated_at: calibration.calibrated_at,
                        platform_hash: self.config.platform_hash.clone(),
                    },
                })
            }
            Credential::PasskeyPrf { credential_id } => {
                let prf_salt = prf_salt_for(
                    user_id.unwrap_or_default(),
                    rp_id.unwrap_or_default(),
                );
                let assertion = self
                    .authenticator
                    .assert_prf(credential_id, &prf_salt)
                    .map_err(|_| KmsError::UnlockDenied)?;
                if !assertion.user_verified {
                    return Err(KmsError::UnlockDenied);
                }
                let hkdf_salt = self.entropy.random_bytes(32);
                let kek = derive_kek_prf(&assertion.prf_output, &hkdf_salt)?;
                Ok(PreparedKek {
                    kek,
                    kcv: None,
                    kdf_params: KdfParams::HkdfPrf {
                        hkdf_salt: b64u(&hkdf_salt),
                        prf_salt: b64u(&prf_salt),
                        credential_id: b64u(credential_id),
                    },
                })
            }
            Credential::PasskeyGate { credential_id, passphrase } => {
                if passphrase.len() < 8 {
                    return Err(KmsError::UnlockDenied);
                }
                let assertion = self
                    .authenticator
                    .assert_gate(credential_id)
                    .map_err(|_| KmsError::UnlockDenied)?;
                if !assertion.user_verified {
                    return Err(KmsError::UnlockDenied);
                }
                let calibration = self.calibration();
                let pepper_iterations = self
                    .config
                    .policy
                    .fixed_pbkdf2_iterations
                    .unwrap_or(PEPPER_ITERATIONS);

                let pepper = Zeroizing::new(self.entropy.random_bytes(32));
                let pepper_salt = self.entropy.random_bytes(16);
                let pepper_key =
                    derive_pepper_key(passphrase.as_bytes(), &pepper_salt, pepper_iterations);
                let pepper_aad = aad_pepper_gate(&enrollment_id.0)?;
                let iv_bytes = self.entropy.random_bytes(12);
                let pepper_ct =
                    aead_encrypt(pepper_key.as_ref(), &pepper_aad, &pepper, &iv_bytes)?;

                let derived = self.derive_gate_kek(passphrase, &pepper, &calibration.salt, calibration.iterations);
                Ok(PreparedKek {
                    kek: derived.kek,
                    kcv: derived.kcv.map(|k| b64u(&k)),
                    kdf_params: KdfParams::Pbkdf2Gate {
                        iterations: calibration.iterations,
                        salt: encode_salt(&calibration.salt),
                        pepper_salt: b64u(&pepper_salt),
                        pepper_iterations,
                        pepper_iv: b64u(&iv_bytes),
                        pepper_ct: b64u(&pepper_ct),
                        last_calibrated_at: calibration.calibrated_at,
                        platform_hash: self.config.platform_hash.clone(),
                        credential_id: b64u(credential_id),
                    },
                })
            }
        }
    }

    fn calibration(&self) -> crate::kdf::Calibration {
        match self.config.policy.fixed_pbkdf2_iterations {
            Some(iterations) => crate::kdf::Calibration {
                iterations,
                salt: self.entropy.random_bytes(16),
                calibrated_at: self.clock.now_ms(),
            },
            None => calibrate_pbkdf2(&self.clock, &self.entropy),
        }
    }

    fn derive_gate_kek(
        &self,
        passphrase: &str,
        pepper: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> crate::kdf::DerivedKek {
        let mut combined =
            Zeroizing::new(Vec::with_capacity(passphrase.len() + pepper.len()));
        combined.extend_from_slice(passphrase.as_bytes());
        combined.extend_from_slice(pepper);
        let derived = derive_kek_pbkdf2(&self.entropy, &combined, salt, iterations);
        scrub(&self.entropy, &mut combined);
        derived
    }

    /// Re-derive the KEK for an existing enrollment from a presented
    /// credential, running whatever ceremony its method requires.
    pub(crate) fn derive_kek_for(
        &mut self,
        enrollment: &EnrollmentConfig,
        credential: &Credential,
    ) -> KmsResult<crate::kdf::DerivedKek> {
        if enrollment.method != credential.method() {
            return Err(KmsError::UnlockDenied);
        }
        match (&enrollment.kdf_params, credential) {
            (
                KdfParams::Pbkdf2 { iterations, salt, .. },
                Credential::Passphrase { passphrase },
            ) => {
                let salt = b64u_decode(salt)?;
                Ok(derive_kek_pbkdf2(
                    &self.entropy,
                    passphrase.as_bytes(),
                    &salt,
                    *iterations,
                ))
            }
            (
                KdfParams::HkdfPrf { hkdf_salt, prf_salt, credential_id },
                Credential::PasskeyPrf { credential_id: presented },
            ) => {
                if b64u_decode(credential_id)? != *presented {
                    return Err(KmsError::UnlockDenied);
                }
                let prf_salt = b64u_decode(prf_salt)?;
                let assertion = self
                    .authenticator
                    .assert_prf(presented, &prf_salt)
                    .map_err(|_| KmsError::UnlockDenied)?;
                if !assertion.user_verified {
                    return Err(KmsError::UnlockDenied);
                }
                let hkdf_salt = b64u_decode(hkdf_salt)?;
                let kek = derive_kek_prf(&assertion.prf_output, &hkdf_salt)?;
                Ok(crate::kdf::DerivedKek { kek, kcv: None })
            }
            (
                KdfParams::Pbkdf2Gate {
                    iterations,
                    salt,
                    pepper_salt,
                    pepper_iterations,
                    pepper_iv,
                    pepper_ct,
                    credential_id,
                    ..
                },
                Credential::PasskeyGate { credential_id: presented, passphrase },
            ) => {
                if b64u_decode(credential_id)? != *presented {
                    return Err(KmsError::UnlockDenied);
                }
                self.check_gate_rate_limit()?;
                let assertion = self
                    .authenticator
                    .assert_gate(presented)
                    .map_err(|_| KmsError::UnlockDenied)?;
                if !assertion.user_verified {
                    return Err(KmsError::UnlockDenied);
                }
                let pepper_key = derive_pepper_key(
                    passphrase.as_bytes(),
                    &b64u_decode(pepper_salt)?,
                    *pepper_iterations,
                );
                let pepper_aad = aad_pepper_gate(&enrollment.id.0)?;
                let pepper = Zeroizing::new(aead_decrypt(
                    pepper_key.as_ref(),
                    &pepper_aad,
                    &b64u_decode(pepper_iv)?,
                    &b64u_decode(pepper_ct)?,
                )?);
                let salt = b64u_decode(salt)?;
                Ok(self.derive_gate_kek(passphrase, &pepper, &salt, *iterations))
            }
            _ => Err(KmsError::ConfigCorrupted(
                "kdf params do not match enrollment method".to_string(),
            )),
        }
    }

    /// Gate-only unlocks are limited to 20 attempts per rolling hour.
    fn check_gate_rate_limit(&mut self) -> KmsResult<()> {
        let now = self.clock.now_ms();
        let mut state = self
            .store_get_json::<GateAttempts>(keys::GATE_ATTEMPTS)?
            .unwrap_or_default();
        state
            .attempts
            .retain(|t| now.saturating_sub(*t) < GATE_ATTEMPT_WINDOW_MS);
        if state.attempts.len() >= GATE_ATTEMPT_LIMIT {
            tracing::warn!("gate-only unlock rate limit reached");
            return Err(KmsError::UnlockDenied);
        }
        state.attempts.push(now);
        self.store_put_json(keys::GATE_ATTEMPTS, &state)
    }

    /// KCV verification for password-bearing methods; constant-time, fast
    /// fail before the wrapped MS is touched.
    pub(crate) fn verify_kcv(
        &self,
        enrollment: &EnrollmentConfig,
        derived: &crate::kdf::DerivedKek,
    ) -> KmsResult<()> {
        match (&enrollment.kcv, &derived.kcv) {
            (Some(expected), Some(actual)) => {
                if kcv_matches(expected, actual)? {
                    Ok(())
                } else {
                    Err(KmsError::UnlockDenied)
                }
            }
            (None, None) => Ok(()),
            _ => Err(KmsError::KcvInvalid),
        }
    }

    /// Build and persist a new enrollment record wrapping `ms`.
    pub(crate) fn persist_enrollment(
        &mut self,
        prepared: PreparedKek,
        method: Method,
        ms: &[u8; 32],
        ms_version: u64,
        name: Option<String>,
        rp_id: Option<String>,
        user_id: Option<String>,
        enrollment_id: EnrollmentId,
    ) -> KmsResult<EnrollmentConfig> {
        let now = self.clock.now_ms();
        let params_canonical = prepared.kdf_params.canonical_string()?;
        let aad = aad_ms_wrap(method.as_str(), prepared.kdf_params.alg(), &params_canonical)?;
        let (ct, iv) = encrypt_ms(&self.entropy, ms, &prepared.kek, &aad)?;
        let config = EnrollmentConfig {
            id: enrollment_id,
            method,
            kdf_params: prepared.kdf_params,
            kcv: prepared.kcv,
            encrypted_ms: b64u(&ct),
            iv: b64u(&iv),
            aad: b64u(&aad),
            ms_version,
            created_at: now,
            updated_at: now,
            platform_hash: self.config.platform_hash.clone(),
            name,
            rp_id,
            user_id,
        };
        self.save_enrollment(&config)?;
        Ok(config)
    }

    /// Decrypt the MS under every supplied credential and assert bytewise
    /// equality across enrollments.
    pub fn verify_ms_consistency(&mut self, creds: &[Credential]) -> KmsResult<bool> {
        let mut canonical: Option<Zeroizing<[u8; 32]>> = None;
        for credential in creds {
            let (enrollment, derived) = self.authenticate(credential)?;
            self.verify_kcv(&enrollment, &derived)?;
            let ms = decrypt_ms(
                &b64u_decode(&enrollment.encrypted_ms)?,
                &derived.kek,
                &b64u_decode(&enrollment.iv)?,
                &b64u_decode(&enrollment.aad)?,
            )?;
            match &canonical {
                None => canonical = Some(ms),
                Some(first) => {
                    if **first != *ms {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Locate the enrollment a presented credential unlocks and derive its
    /// KEK in the same pass. Passphrase candidates are distinguished by
    /// constant-time KCV; passkeys by credential id.
    pub(crate) fn authenticate(
        &mut self,
        credential: &Credential,
    ) -> KmsResult<(EnrollmentConfig, crate::kdf::DerivedKek)> {
        let index = self.load_enrollment_index()?;
        if index.is_empty() {
            return Err(KmsError::ConfigNotFound("enrollment:index".to_string()));
        }
        let method = credential.method();
        let candidates: Vec<EnrollmentConfig> = index
            .iter()
            .filter(|summary| summary.method == method)
            .map(|summary| self.load_enrollment(&summary.id))
            .collect::<KmsResult<_>>()?;
        if candidates.is_empty() {
            return Err(KmsError::UnlockMethodUnknown(method.as_str().to_string()));
        }
        match credential {
            Credential::Passphrase { passphrase } => {
                for candidate in candidates {
                    if let KdfParams::Pbkdf2 { iterations, salt, .. } = &candidate.kdf_params {
                        let salt = b64u_decode(salt)?;
                        let derived = derive_kek_pbkdf2(
                            &self.entropy,
                            passphrase.as_bytes(),
                            &salt,
                            *iterations,
                        );
                        if let (Some(expected), Some(actual)) = (&candidate.kcv, &derived.kcv) {
                            if kcv_matches(expected, actual)? {
                                return Ok((candidate, derived));
                            }
                        }
                    }
                }
                Err(KmsError::UnlockDenied)
            }
            Credential::PasskeyPrf { credential_id }
            | Credential::PasskeyGate { credential_id, .. } => {
                let enrollment = candidates
                    .into_iter()
                    .find(|candidate| {
                        let stored = match &candidate.kdf_params {
                            KdfParams::HkdfPrf { credential_id, .. } => credential_id,
                            KdfParams::Pbkdf2Gate { credential_id, .. } => credential_id,
                            KdfParams::Pbkdf2 { .. } => return false,
                        };
                        b64u_decode(stored).map(|s| s == *credential_id).unwrap_or(false)
                    })
                    .ok_or(KmsError::UnlockDenied)?;
                let derived = self.derive_kek_for(&enrollment, credential)?;
                Ok((enrollment, derived))
            }
        }
    }

    pub(crate) fn new_enrollment_id(&self) -> EnrollmentId {
        EnrollmentId(uuid_v4(&self.entropy))
    }
}

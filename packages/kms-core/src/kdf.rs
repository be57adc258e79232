//! Credential key derivation: calibrated PBKDF2, HKDF-Expand with
//! versioned salts, and the key-check-value split.

use crate::adapters::{ClockAdapter, EntropyAdapter};
use crate::canonical::{b64u, b64u_decode, encode_canonical_string};
use crate::crypto::{scrub, sha256};
use crate::error::{KmsError, KmsResult};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const KDF_PBKDF2: &str = "PBKDF2-HMAC-SHA256";
pub const KDF_HKDF_PRF: &str = "HKDF-SHA256";

pub const INFO_KEK_WRAP: &[u8] = b"ATS/KMS/KEK-wrap/v2";
pub const INFO_MKEK: &[u8] = b"ATS/KMS/MKEK/v2";
pub const INFO_SESSION_KEK: &[u8] = b"ATS/KMS/SessionKEK/v1";
pub const INFO_PEPPER_GATE: &[u8] = b"ATS/KMS/pepper-gate/v2";

const MKEK_SALT_CONTEXT: &[u8] = b"ATS/KMS/MKEK/salt/v2";

pub const MIN_ITERATIONS: u32 = 50_000;
pub const MAX_ITERATIONS: u32 = 2_000_000;
const ITERATION_STEP: u32 = 5_000;
const TARGET_MIDPOINT_MS: u64 = 220;
const TARGET_FLOOR_MS: u64 = 150;
const TARGET_CEIL_MS: u64 = 300;
const WARMUP_ITERATIONS: u32 = 10_000;
const PROBE_ITERATIONS: u32 = 100_000;

/// Recalibrate after this long even when the platform is unchanged.
pub const RECALIBRATION_AGE_MS: u64 = 90 * 24 * 60 * 60 * 1000;

/// Per-enrollment KDF parameters, persisted inside the enrollment config
/// and bound into the master-secret wrap AAD as a canonical JSON string.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "alg")]
pub enum KdfParams {
    /// Calibrated PBKDF2 for the plain passphrase method.
    #[serde(rename = "PBKDF2-HMAC-SHA256")]
    Pbkdf2 {
        iterations: u32,
        salt: String,
        last_calibrated_at: u64,
        platform_hash: String,
    },
    /// HKDF over a WebAuthn PRF output.
    #[serde(rename = "HKDF-SHA256")]
    HkdfPrf {
        hkdf_salt: String,
        prf_salt: String,
        credential_id: String,
    },
    /// Gate-only fallback: PBKDF2 over `passphrase || pepper`, with the
    /// pepper stored AEAD-sealed under a second PBKDF2-derived key and
    /// released only after a user-verified assertion.
    #[serde(rename = "PBKDF2-HMAC-SHA256-GATE")]
    Pbkdf2Gate {
        iterations: u32,
        salt: String,
        pepper_salt: String,
        pepper_iterations: u32,
        pepper_iv: String,
        pepper_ct: String,
        last_calibrated_at: u64,
        platform_hash: String,
        credential_id: String,
    },
}

impl KdfParams {
    pub fn alg(&self) -> &'static str {
        match self {
            KdfParams::Pbkdf2 { .. } => KDF_PBKDF2,
            KdfParams::HkdfPrf { .. } => KDF_HKDF_PRF,
            KdfParams::Pbkdf2Gate { .. } => "PBKDF2-HMAC-SHA256-GATE",
        }
    }

    /// Canonical JSON string embedded into the MS wrap AAD.
    pub fn canonical_string(&self) -> KmsResult<String> {
        let value = serde_json::to_value(self)
            .map_err(|e| KmsError::Internal(format!("kdf params encode: {e}")))?;
        encode_canonical_string(&value)
    }
}

/// Derived KEK plus the key check value for password-bearing methods.
pub struct DerivedKek {
    pub kek: Zeroizing<[u8; 32]>,
    pub kcv: Option<[u8; 32]>,
}

/// One-pass 64-byte PBKDF2 derivation split into KEK and KCV material:
/// `kek = out[0..32]`, `kcv = SHA-256(out[32..64])`.
pub fn derive_kek_pbkdf2<E: EntropyAdapter>(
    entropy: &E,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> DerivedKek {
    let mut out = Zeroizing::new([0u8; 64]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out[..]);
    let mut kek = Zeroizing::new([0u8; 32]);
    kek.copy_from_slice(&out[..32]);
    let kcv = sha256(&out[32..]);
    scrub(entropy, &mut out[..]);
    DerivedKek { kek, kcv: Some(kcv) }
}

/// Constant-time KCV comparison. A mismatch is a fast-fail `unlock.denied`
/// without touching the wrapped master secret.
pub fn kcv_matches(expected_b64u: &str, actual: &[u8; 32]) -> KmsResult<bool> {
    let expected = b64u_decode(expected_b64u)?;
    if expected.len() != 32 {
        return Err(KmsError::ConfigCorrupted("kcv length".to_string()));
    }
    Ok(expected.ct_eq(actual).into())
}

/// HKDF-Expand with a mandatory deterministic salt; all-zero salts are
/// rejected at the call sites by construction (salts are SHA-256 outputs
/// or CSRNG lease salts).
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> KmsResult<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut okm[..])
        .map_err(|_| KmsError::Internal("hkdf expand failed".to_string()))?;
    Ok(okm)
}

/// MKEK = HKDF-Expand(MS, salt = SHA-256("ATS/KMS/MKEK/salt/v2"),
/// info = "ATS/KMS/MKEK/v2").
pub fn derive_mkek(ms: &[u8; 32]) -> KmsResult<Zeroizing<[u8; 32]>> {
    let salt = sha256(MKEK_SALT_CONTEXT);
    hkdf_expand(ms, &salt, INFO_MKEK)
}

/// SessionKEK = HKDF-Expand(MS, salt = lease_salt, info = SessionKEK/v1).
pub fn derive_session_kek(ms: &[u8; 32], lease_salt: &[u8]) -> KmsResult<Zeroizing<[u8; 32]>> {
    hkdf_expand(ms, lease_salt, INFO_SESSION_KEK)
}

/// KEK from a WebAuthn PRF output.
pub fn derive_kek_prf(prf_output: &[u8; 32], hkdf_salt: &[u8]) -> KmsResult<Zeroizing<[u8; 32]>> {
    hkdf_expand(prf_output, hkdf_salt, INFO_KEK_WRAP)
}

/// Key protecting the stored pepper of the gate-only fallback.
pub fn derive_pepper_key(
    passphrase: &[u8],
    pepper_salt: &[u8],
    iterations: u32,
) -> Zeroizing<[u8; 32]> {
    let mut raw = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase, pepper_salt, iterations, &mut raw[..]);
    let salt = sha256(b"ATS/KMS/pepper-gate/salt/v2");
    let hk = Hkdf::<Sha256>::new(Some(&salt), raw.as_ref());
    let mut okm = Zeroizing::new([0u8; 32]);
    // Expand cannot fail for a 32-byte output.
    let _ = hk.expand(INFO_PEPPER_GATE, &mut okm[..]);
    okm
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Calibration {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub calibrated_at: u64,
}

/// Calibrate PBKDF2 iterations against the current platform: warm up with
/// 10k, probe 100k, extrapolate to the 220 ms midpoint, clamp to
/// [50_000, 2_000_000], round to a multiple of 5_000, then re-measure once
/// and re-adjust if the result lands outside [150, 300] ms.
pub fn calibrate_pbkdf2<C: ClockAdapter, E: EntropyAdapter>(
    clock: &C,
    entropy: &E,
) -> Calibration {
    let salt = entropy.random_bytes(16);
    let mut sink = Zeroizing::new([0u8; 32]);

    pbkdf2_hmac::<Sha256>(b"calibration", &salt, WARMUP_ITERATIONS, &mut sink[..]);

    let probe_ms = measure(clock, &salt, PROBE_ITERATIONS, &mut sink).max(1);
    let projected =
        (PROBE_ITERATIONS as u64).saturating_mul(TARGET_MIDPOINT_MS) / probe_ms;
    let mut iterations = round_iterations(projected);

    let check_ms = measure(clock, &salt, iterations, &mut sink).max(1);
    if !(TARGET_FLOOR_MS..=TARGET_CEIL_MS).contains(&check_ms) {
        let readjusted =
            (iterations as u64).saturating_mul(TARGET_MIDPOINT_MS) / check_ms;
        iterations = round_iterations(readjusted);
    }

    Calibration {
        iterations,
        salt,
        calibrated_at: clock.now_ms(),
    }
}

fn round_iterations(projected: u64) -> u32 {
    let clamped = projected.clamp(MIN_ITERATIONS as u64, MAX_ITERATIONS as u64) as u32;
    let rounded = (clamped / ITERATION_STEP) * ITERATION_STEP;
    rounded.max(MIN_ITERATIONS)
}

fn measure<C: ClockAdapter>(clock: &C, salt: &[u8], iterations: u32, sink: &mut [u8; 32]) -> u64 {
    let start = clock.now_ms();
    pbkdf2_hmac::<Sha256>(b"calibration", salt, iterations, sink);
    clock.now_ms().saturating_sub(start)
}

/// Whether an enrollment's PBKDF2 parameters are due for recalibration.
pub fn needs_recalibration(
    last_calibrated_at: u64,
    stored_platform_hash: &str,
    current_platform_hash: &str,
    now_ms: u64,
) -> bool {
    stored_platform_hash != current_platform_hash
        || now_ms.saturating_sub(last_calibrated_at) > RECALIBRATION_AGE_MS
}

/// PRF salt handed to the authenticator, derived from stable identifiers so
/// the same credential always evaluates the same PRF input.
pub fn prf_salt_for(user_id: &str, rp_id: &str) -> [u8; 32] {
    let value = json!({
        "context": "ATS/KMS/prf-salt/v2",
        "rp_id": rp_id,
        "user_id": user_id,
    });
    // encode_canonical only fails on non-integer numbers; none are present.
    let bytes = encode_canonical_string(&value).unwrap_or_default();
    sha256(bytes.as_bytes())
}

pub fn encode_salt(salt: &[u8]) -> String {
    b64u(salt)
}

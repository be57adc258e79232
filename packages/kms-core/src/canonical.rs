//! Canonical JSON and the AAD schemas bound to every AEAD operation.
//!
//! One serializer is used byte-identically for AAD, audit chain-hash
//! inputs, certificate signing inputs, and the backup bundle: object keys
//! sorted by codepoint, compact separators, RFC 8259 escaping, integers
//! only. `serde_json`'s default map representation is BTreeMap-backed, so
//! key order falls out of construction; this module enforces the rest.

use crate::error::{KmsError, KmsResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

pub const AAD_VERSION: u64 = 1;
pub const KMS_VERSION: u64 = 2;

/// Serialize a value in canonical form. Rejects floats and any number with
/// a fractional or exponent representation; those have no canonical byte
/// form.
pub fn encode_canonical(value: &Value) -> KmsResult<Vec<u8>> {
    check_canonical(value)?;
    serde_json::to_vec(value).map_err(|e| KmsError::Internal(format!("canonical encode: {e}")))
}

pub fn encode_canonical_string(value: &Value) -> KmsResult<String> {
    let bytes = encode_canonical(value)?;
    String::from_utf8(bytes).map_err(|e| KmsError::Internal(format!("canonical utf8: {e}")))
}

fn check_canonical(value: &Value) -> KmsResult<()> {
    match value {
        Value::Number(n) => {
            if n.as_i64().is_none() && n.as_u64().is_none() {
                return Err(KmsError::Internal(
                    "non-integer number in canonical value".to_string(),
                ));
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_canonical(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map {
                check_canonical(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn b64u(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64u_decode(text: &str) -> KmsResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|_| KmsError::ConfigCorrupted("invalid base64url field".to_string()))
}

/// AAD for the master-secret wrap. `kdf_params` is itself a canonical JSON
/// string, embedded as a string so the whole parameter block is
/// tamper-bound without a nested-schema dependency.
pub fn aad_ms_wrap(method: &str, kdf: &str, kdf_params_canonical: &str) -> KmsResult<Vec<u8>> {
    encode_canonical(&json!({
        "aad_version": AAD_VERSION,
        "kdf": kdf,
        "kdf_params": kdf_params_canonical,
        "kms_version": KMS_VERSION,
        "method": method,
    }))
}

/// AAD for a wrapped application key under MKEK.
pub fn aad_wrapped_key(
    kid: &str,
    alg: &str,
    purpose: &str,
    created_at: u64,
) -> KmsResult<Vec<u8>> {
    encode_canonical(&json!({
        "aad_version": AAD_VERSION,
        "alg": alg,
        "created_at": created_at,
        "kid": kid,
        "kms_version": KMS_VERSION,
        "purpose": purpose,
        "record_type": "wrapped-key",
    }))
}

/// AAD for the lease copy of a VAPID key rewrapped under SessionKEK.
pub fn aad_lease_wrap(lease_id: &str, kid: &str) -> KmsResult<Vec<u8>> {
    encode_canonical(&json!({
        "aad_version": AAD_VERSION,
        "kid": kid,
        "kms_version": KMS_VERSION,
        "lease_id": lease_id,
        "purpose": "lease-wrap",
        "record_type": "lease-wrap",
    }))
}

/// AAD for LAK/KIAK private halves wrapped under the LeaseRootKey.
/// `record_type` distinguishes the two; LRK never wraps application keys.
pub fn aad_root_wrap(record_type: &str, id: &str) -> KmsResult<Vec<u8>> {
    encode_canonical(&json!({
        "aad_version": AAD_VERSION,
        "id": id,
        "kms_version": KMS_VERSION,
        "record_type": record_type,
    }))
}

/// AAD for the backup-bundle copy of the master secret.
pub fn aad_backup(bundle_id: &str) -> KmsResult<Vec<u8>> {
    encode_canonical(&json!({
        "aad_version": AAD_VERSION,
        "bundle_id": bundle_id,
        "kms_version": KMS_VERSION,
        "record_type": "backup",
    }))
}

/// AAD for the stored pepper of the gate-only fallback.
pub fn aad_pepper_gate(enrollment_id: &str) -> KmsResult<Vec<u8>> {
    encode_canonical(&json!({
        "aad_version": AAD_VERSION,
        "enrollment_id": enrollment_id,
        "kms_version": KMS_VERSION,
        "record_type": "pepper-gate",
    }))
}

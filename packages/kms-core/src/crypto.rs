//! Primitive operations over the RustCrypto stack, plus the non-exporting
//! key handle types. Private halves live only inside the handles; there is
//! no API that returns them once a handle exists.

use crate::adapters::EntropyAdapter;
use crate::canonical::{b64u, encode_canonical};
use crate::error::{KmsError, KmsResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{
    Signature as Ed25519Signature, SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
};
use p256::ecdsa::{
    Signature as P256Signature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use signature::{Signer as EdSigner, Verifier as EdVerifier};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

pub fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Overwrite a sensitive buffer with fresh random bytes, then zero it.
/// Used on every unlock-scope exit for MS, raw KEK bytes, and combined
/// passphrase material.
pub fn scrub<E: EntropyAdapter>(entropy: &E, buf: &mut [u8]) {
    let noise = entropy.random_bytes(buf.len());
    buf.copy_from_slice(&noise);
    buf.zeroize();
}

pub fn aead_encrypt(
    key_bytes: &[u8],
    aad: &[u8],
    plaintext: &[u8],
    nonce: &[u8],
) -> KmsResult<Vec<u8>> {
    if key_bytes.len() != 32 {
        return Err(KmsError::Internal("invalid aead key length".to_string()));
    }
    if nonce.len() != 12 {
        return Err(KmsError::Internal("invalid aead nonce length".to_string()));
    }
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            aes_gcm::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|_| KmsError::Internal("aead encrypt failed".to_string()))
}

/// Decrypt; any tag or AAD failure is `aad.mismatch` and is treated as
/// possible tampering by every caller.
pub fn aead_decrypt(
    key_bytes: &[u8],
    aad: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> KmsResult<Vec<u8>> {
    if key_bytes.len() != 32 {
        return Err(KmsError::Internal("invalid aead key length".to_string()));
    }
    if nonce.len() != 12 {
        return Err(KmsError::Internal("invalid aead nonce length".to_string()));
    }
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            aes_gcm::aead::Payload { msg: ciphertext, aad },
        )
        .map_err(|_| {
            tracing::warn!("aead decrypt failed: tag or aad mismatch");
            KmsError::AadMismatch
        })
}

/// ECDSA P-256 signing handle restricted to `sign`; the scalar is private
/// to this struct and never re-exported.
pub struct Es256Handle {
    key: P256SigningKey,
}

impl fmt::Debug for Es256Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Es256Handle(<redacted>)")
    }
}

impl Es256Handle {
    pub fn from_raw(scalar: &[u8]) -> KmsResult<Self> {
        let key = P256SigningKey::from_slice(scalar)
            .map_err(|_| KmsError::Internal("invalid p256 scalar".to_string()))?;
        Ok(Self { key })
    }

    /// P-1363 signature, exactly 64 bytes.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig: P256Signature = self.key.sign(msg);
        let bytes = sig.to_bytes();
        let mut out = [0u8; 64];
        out.copy_from_slice(&bytes);
        out
    }

    /// Raw uncompressed SEC1 point: `0x04 || x || y`.
    pub fn public_uncompressed(&self) -> [u8; 65] {
        let point = P256VerifyingKey::from(&self.key).to_encoded_point(false);
        let mut out = [0u8; 65];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// RFC 7638 JWK thumbprint of the public key.
    pub fn thumbprint(&self) -> KmsResult<String> {
        let raw = self.public_uncompressed();
        es256_thumbprint_from_raw(&raw)
    }
}

/// Generate a fresh P-256 key from adapter entropy. A drawn scalar outside
/// the group order is redrawn; statistically this never loops.
pub fn es256_generate<E: EntropyAdapter>(entropy: &E) -> KmsResult<(Es256Handle, Zeroizing<Vec<u8>>)> {
    for _ in 0..8 {
        let mut candidate = Zeroizing::new(entropy.random_bytes(32));
        if let Ok(handle) = Es256Handle::from_raw(&candidate) {
            return Ok((handle, std::mem::take(&mut candidate)));
        }
    }
    Err(KmsError::Internal("p256 scalar generation failed".to_string()))
}

pub fn es256_thumbprint_from_raw(pub_raw: &[u8]) -> KmsResult<String> {
    if pub_raw.len() != 65 || pub_raw[0] != 0x04 {
        return Err(KmsError::ConfigCorrupted("invalid sec1 public key".to_string()));
    }
    let jwk = json!({
        "crv": "P-256",
        "kty": "EC",
        "x": b64u(&pub_raw[1..33]),
        "y": b64u(&pub_raw[33..65]),
    });
    Ok(b64u(&sha256(&encode_canonical(&jwk)?)))
}

/// RFC 7638 thumbprint for an Ed25519 (OKP) public key.
pub fn ed25519_thumbprint_from_raw(pub_bytes: &[u8]) -> KmsResult<String> {
    if pub_bytes.len() != 32 {
        return Err(KmsError::ConfigCorrupted("invalid ed25519 public key".to_string()));
    }
    let jwk = json!({
        "crv": "Ed25519",
        "kty": "OKP",
        "x": b64u(pub_bytes),
    });
    Ok(b64u(&sha256(&encode_canonical(&jwk)?)))
}

pub fn es256_verify(pub_raw: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(key) = P256VerifyingKey::from_sec1_bytes(pub_raw) else {
        return false;
    };
    let Ok(sig) = P256Signature::from_slice(sig) else {
        return false;
    };
    key.verify(msg, &sig).is_ok()
}

/// Convert a DER-encoded ECDSA signature to P-1363 `r || s`, stripping the
/// SEQUENCE/INTEGER wrappers and left-zero-padding each scalar to 32 bytes.
/// Ships even though the provider emits P-1363 natively, for shape
/// validation and cross-provider compatibility.
pub fn der_to_p1363(der: &[u8]) -> KmsResult<[u8; 64]> {
    let err = || KmsError::Internal("malformed der signature".to_string());
    if der.len() < 8 || der[0] != 0x30 {
        return Err(err());
    }
    let mut idx = 2;
    if der[1] & 0x80 != 0 {
        idx += (der[1] & 0x7f) as usize;
    }
    let mut out = [0u8; 64];
    for half in 0..2 {
        if idx + 2 > der.len() || der[idx] != 0x02 {
            return Err(err());
        }
        let len = der[idx + 1] as usize;
        idx += 2;
        if idx + len > der.len() {
            return Err(err());
        }
        let mut scalar = &der[idx..idx + len];
        while scalar.len() > 1 && scalar[0] == 0 {
            scalar = &scalar[1..];
        }
        if scalar.len() > 32 {
            return Err(err());
        }
        let offset = half * 32 + (32 - scalar.len());
        out[offset..offset + scalar.len()].copy_from_slice(scalar);
        idx += len;
    }
    Ok(out)
}

/// Ed25519 signing handle restricted to `sign`.
pub struct Ed25519Handle {
    key: Ed25519SigningKey,
}

impl fmt::Debug for Ed25519Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Handle(<redacted>)")
    }
}

impl Ed25519Handle {
    pub fn from_raw(seed: &[u8]) -> KmsResult<Self> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| KmsError::Internal("invalid ed25519 seed length".to_string()))?;
        Ok(Self {
            key: Ed25519SigningKey::from_bytes(&seed),
        })
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig: Ed25519Signature = self.key.sign(msg);
        sig.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

pub fn ed25519_generate<E: EntropyAdapter>(entropy: &E) -> KmsResult<(Ed25519Handle, Zeroizing<Vec<u8>>)> {
    let seed = Zeroizing::new(entropy.random_bytes(32));
    let handle = Ed25519Handle::from_raw(&seed)?;
    Ok((handle, seed))
}

pub fn ed25519_verify(pub_bytes: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(pub_bytes) = <[u8; 32]>::try_from(pub_bytes) else {
        return false;
    };
    let Ok(key) = Ed25519VerifyingKey::from_bytes(&pub_bytes) else {
        return false;
    };
    let Ok(sig) = <[u8; 64]>::try_from(sig) else {
        return false;
    };
    key.verify(msg, &Ed25519Signature::from_bytes(&sig)).is_ok()
}

/// Identity of an audit signer: base64url SHA-256 of its public key.
pub fn signer_id(pub_bytes: &[u8]) -> String {
    b64u(&sha256(pub_bytes))
}

/// UUID v4 built from adapter entropy so deterministic fixtures stay
/// deterministic.
pub fn uuid_v4<E: EntropyAdapter>(entropy: &E) -> String {
    let bytes = entropy.random_bytes(16);
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes);
    uuid::Builder::from_random_bytes(raw).into_uuid().to_string()
}

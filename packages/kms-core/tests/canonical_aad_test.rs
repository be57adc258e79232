mod common;

use ats_kms_core::canonical::{
    aad_wrapped_key, b64u, b64u_decode, encode_canonical, encode_canonical_string,
};
use ats_kms_core::crypto::{
    aead_decrypt, aead_encrypt, der_to_p1363, ed25519_generate, ed25519_verify,
    es256_generate, es256_thumbprint_from_raw, sha256,
};
use ats_kms_core::delegation::scope_covers;
use ats_kms_core::kdf::{derive_mkek, derive_session_kek, kcv_matches};
use common::SeededEntropy;
use serde_json::json;

#[test]
fn canonical_json_sorts_keys_and_strips_whitespace() {
    let value = json!({
        "zeta": 1,
        "alpha": "x",
        "nested": { "b": 2, "a": 1 },
    });
    let bytes = encode_canonical(&value).expect("encode");
    assert_eq!(
        bytes,
        br#"{"alpha":"x","nested":{"a":1,"b":2},"zeta":1}"#.to_vec()
    );
}

#[test]
fn canonical_json_rejects_floats() {
    let value = json!({ "ratio": 0.5 });
    assert!(encode_canonical(&value).is_err());
}

#[test]
fn wrapped_key_aad_is_stable() {
    let aad = aad_wrapped_key("kid-1", "ES256", "vapid", 1_750_000_000_000).expect("aad");
    let expected = br#"{"aad_version":1,"alg":"ES256","created_at":1750000000000,"kid":"kid-1","kms_version":2,"purpose":"vapid","record_type":"wrapped-key"}"#;
    assert_eq!(aad, expected.to_vec());
}

#[test]
fn aead_rejects_any_aad_or_ciphertext_drift() {
    let entropy = SeededEntropy::new(9);
    use ats_kms_core::adapters::EntropyAdapter;
    let key: [u8; 32] = entropy.random_bytes(32).try_into().unwrap();
    let nonce: [u8; 12] = entropy.random_bytes(12).try_into().unwrap();
    let aad = b"{\"aad_version\":1}".to_vec();
    let ct = aead_encrypt(&key, &aad, b"secret payload", &nonce).expect("encrypt");

    let plain = aead_decrypt(&key, &aad, &nonce, &ct).expect("decrypt");
    assert_eq!(plain, b"secret payload");

    let mut bad_aad = aad.clone();
    bad_aad[3] ^= 0x01;
    let err = aead_decrypt(&key, &bad_aad, &nonce, &ct).unwrap_err();
    assert_eq!(err.code(), "aad.mismatch");

    let mut bad_ct = ct.clone();
    bad_ct[0] ^= 0x01;
    let err = aead_decrypt(&key, &aad, &nonce, &bad_ct).unwrap_err();
    assert_eq!(err.code(), "aad.mismatch");
}

#[test]
fn der_signature_converts_to_p1363() {
    // r with a leading-zero high byte, s shorter than 32 bytes.
    let r = [
        0x00u8, 0x9a, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44,
        0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x01, 0x02, 0x03,
        0x04, 0x05, 0x06, 0x07, 0x08,
    ];
    let s = [0x7fu8, 0x01, 0x02, 0x03];
    let mut der = vec![0x30u8, (4 + r.len() + s.len()) as u8, 0x02, r.len() as u8];
    der.extend_from_slice(&r);
    der.push(0x02);
    der.push(s.len() as u8);
    der.extend_from_slice(&s);

    let p1363 = der_to_p1363(&der).expect("convert");
    assert_eq!(p1363[0], 0);
    assert_eq!(&p1363[1..32], &r[1..]);
    assert_eq!(&p1363[32..60], &[0u8; 28]);
    assert_eq!(&p1363[60..], &s);

    assert!(der_to_p1363(&[0x30, 0x02, 0x01, 0x00]).is_err());
}

#[test]
fn es256_signatures_are_64_bytes_and_verify() {
    let entropy = SeededEntropy::new(11);
    let (handle, _raw) = es256_generate(&entropy).expect("generate");
    let sig = handle.sign(b"signing input");
    assert_eq!(sig.len(), 64);
    assert!(ats_kms_core::crypto::es256_verify(
        &handle.public_uncompressed(),
        b"signing input",
        &sig
    ));
}

#[test]
fn jwk_thumbprint_follows_rfc7638() {
    let entropy = SeededEntropy::new(13);
    let (handle, _raw) = es256_generate(&entropy).expect("generate");
    let pub_raw = handle.public_uncompressed();
    let thumbprint = es256_thumbprint_from_raw(&pub_raw).expect("thumbprint");
    assert_eq!(thumbprint.len(), 43);

    let jwk = format!(
        r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
        b64u(&pub_raw[1..33]),
        b64u(&pub_raw[33..65]),
    );
    assert_eq!(thumbprint, b64u(&sha256(jwk.as_bytes())));
    assert_eq!(handle.thumbprint().expect("handle thumbprint"), thumbprint);
}

#[test]
fn ed25519_sign_verify_roundtrip() {
    let entropy = SeededEntropy::new(17);
    let (handle, _raw) = ed25519_generate(&entropy).expect("generate");
    let sig = handle.sign(b"chain-hash-bytes");
    assert!(ed25519_verify(&handle.public_bytes(), b"chain-hash-bytes", &sig));
    assert!(!ed25519_verify(&handle.public_bytes(), b"other", &sig));
}

#[test]
fn kcv_comparison_detects_mismatch() {
    let expected = [5u8; 32];
    let encoded = b64u(&expected);
    assert!(kcv_matches(&encoded, &expected).expect("match"));
    let mut other = expected;
    other[31] ^= 0x01;
    assert!(!kcv_matches(&encoded, &other).expect("mismatch"));
}

#[test]
fn hkdf_contexts_are_domain_separated() {
    let ms = [3u8; 32];
    let mkek = derive_mkek(&ms).expect("mkek");
    let session = derive_session_kek(&ms, &[9u8; 32]).expect("session");
    assert_ne!(mkek.as_ref(), session.as_ref());

    let other_salt = derive_session_kek(&ms, &[10u8; 32]).expect("session 2");
    assert_ne!(session.as_ref(), other_salt.as_ref());
}

#[test]
fn scope_wildcards_match_prefixes_only() {
    let scope = vec!["vapid:issue".to_string(), "lease:*".to_string()];
    assert!(scope_covers(&scope, "vapid:issue"));
    assert!(scope_covers(&scope, "lease:expire"));
    assert!(scope_covers(&scope, "lease:revoke"));
    assert!(!scope_covers(&scope, "vapid:issue2"));
    assert!(!scope_covers(&scope, "enrollment:add"));
    assert!(scope_covers(&["*".to_string()], "anything:at:all"));
}

#[test]
fn base64url_roundtrip_has_no_padding() {
    let bytes: Vec<u8> = (0..=63).collect();
    let encoded = b64u(&bytes);
    assert!(!encoded.contains('='));
    assert_eq!(b64u_decode(&encoded).expect("decode"), bytes);
}

#[test]
fn canonical_string_embeds_for_kdf_params() {
    let value = json!({ "iterations": 250_000, "salt": "c2FsdA" });
    let text = encode_canonical_string(&value).expect("string");
    assert_eq!(text, r#"{"iterations":250000,"salt":"c2FsdA"}"#);
}

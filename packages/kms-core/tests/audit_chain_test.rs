mod common;

use ats_kms_core::audit::GENESIS_HASH;
use ats_kms_core::lease::CreateLeaseRequest;
use ats_kms_core::quota::QuotaConfig;
use ats_kms_core::types::{Credential, Endpoint, SignerKind, UserId};
use ats_kms_core::vapid::IssueVapidJwtRequest;
use common::booted_kms;

const PASSPHRASE: &str = "correct horse battery staple";

fn credential() -> Credential {
    Credential::Passphrase {
        passphrase: PASSPHRASE.to_string(),
    }
}

fn endpoint() -> Endpoint {
    Endpoint {
        url: "https://push.example/send/1".to_string(),
        aud: "https://push.example".to_string(),
        eid: "e1".to_string(),
    }
}

fn issue_request(lease_id: ats_kms_core::types::LeaseId) -> IssueVapidJwtRequest {
    IssueVapidJwtRequest {
        lease_id,
        endpoint: endpoint(),
        kid: None,
        rid: None,
        jti: None,
    }
}

#[test]
fn genesis_previous_hash_is_64_hex_zeros() {
    assert_eq!(GENESIS_HASH, hex::encode([0u8; 32]));
    assert_eq!(GENESIS_HASH.len(), 64);
}

#[test]
fn sequencing_and_linkage_hold_over_mixed_activity() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = kms
        .create_lease(CreateLeaseRequest {
            user_id: UserId("u1".to_string()),
            subs: vec![endpoint()],
            ttl_hours: 2,
            credential: credential(),
            kid: None,
            quotas: None,
        })
        .expect("lease");
    for _ in 0..3 {
        kms.issue_vapid_jwt(issue_request(grant.lease_id.clone()))
            .expect("issue");
    }

    let entries = kms.get_audit_log(0, None).expect("log");
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.seq_num, i as u64);
        if i == 0 {
            assert_eq!(entry.previous_hash, GENESIS_HASH);
        } else {
            assert_eq!(entry.previous_hash, entries[i - 1].chain_hash);
        }
    }
    let report = kms.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.entries, entries.len());
}

#[test]
fn tampered_chain_hash_is_detected() {
    let (mut kms, storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    kms.generate_vapid(&credential()).expect("second key");

    let raw = storage.get_raw("kms", "audit:2").expect("entry 2");
    let mut entry: serde_json::Value = serde_json::from_slice(&raw).expect("entry json");
    let mut chain_hash = entry["chain_hash"].as_str().unwrap().to_string();
    let flipped = if chain_hash.ends_with('A') { 'B' } else { 'A' };
    chain_hash.pop();
    chain_hash.push(flipped);
    entry["chain_hash"] = serde_json::Value::String(chain_hash);
    storage.put_raw("kms", "audit:2", serde_json::to_vec(&entry).unwrap());

    let report = kms.verify_audit_chain().expect("verify");
    assert!(!report.valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("Hash mismatch at 2")));
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("Chain break at 3")));
}

#[test]
fn tampered_entry_body_is_detected() {
    let (mut kms, storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");

    let raw = storage.get_raw("kms", "audit:1").expect("entry 1");
    let mut entry: serde_json::Value = serde_json::from_slice(&raw).expect("entry json");
    entry["op"] = serde_json::Value::String("unlock-forged".to_string());
    storage.put_raw("kms", "audit:1", serde_json::to_vec(&entry).unwrap());

    let report = kms.verify_audit_chain().expect("verify");
    assert!(!report.valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("Hash mismatch at 1")));
}

#[test]
fn lak_entries_verify_through_their_certificates() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = kms
        .create_lease(CreateLeaseRequest {
            user_id: UserId("u1".to_string()),
            subs: vec![endpoint()],
            ttl_hours: 1,
            credential: credential(),
            kid: None,
            quotas: None,
        })
        .expect("lease");
    let issued = kms
        .issue_vapid_jwt(issue_request(grant.lease_id))
        .expect("issue");

    let cert = issued.audit_entry.cert.expect("cert");
    assert_eq!(cert.cert_type, "audit-delegation");
    assert!(cert.covers("vapid:issue"));
    assert!(cert.covers("lease:expire"));
    assert!(!cert.covers("enrollment:add"));
    assert!(cert.valid_at(issued.audit_entry.timestamp_ms));

    let uak_pub = ats_kms_core::canonical::b64u_decode(
        &kms.get_audit_public_key().expect("uak pub"),
    )
    .expect("decode");
    assert!(cert.verify(&uak_pub));
}

#[test]
fn kiak_rotation_keeps_chain_verifiable() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    kms.rotate_instance_audit_key(&credential()).expect("rotate");

    let entries = kms.get_audit_log(0, None).expect("log");
    let rotation = entries
        .iter()
        .find(|e| e.op == "audit:rotate")
        .expect("rotation entry");
    assert_eq!(rotation.signer, SignerKind::Kiak);
    assert!(rotation.sig_new.is_some());
    assert!(rotation.details.as_ref().unwrap()["new_pub"].is_string());

    let report = kms.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);

    // The rotated key signs subsequent system entries.
    kms.reset().expect("reset");
    let report = kms.verify_audit_chain().expect("verify after reset");
    assert!(report.valid, "errors: {:?}", report.errors);
}

#[test]
fn anchor_entry_lands_every_hundred() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let quotas = QuotaConfig {
        tokens_per_hour: 1_000,
        sends_per_minute: 1_000,
        burst_sends: 1_000,
        sends_per_minute_per_eid: 1_000,
    };
    let grant = kms
        .create_lease(CreateLeaseRequest {
            user_id: UserId("u1".to_string()),
            subs: vec![endpoint()],
            ttl_hours: 2,
            credential: credential(),
            kid: None,
            quotas: Some(quotas),
        })
        .expect("lease");
    while kms.get_audit_state().expect("state").next_seq_num <= 100 {
        kms.issue_vapid_jwt(issue_request(grant.lease_id.clone()))
            .expect("issue");
    }

    let entries = kms.get_audit_log(0, None).expect("log");
    let anchor = entries.iter().find(|e| e.op == "anchor").expect("anchor");
    assert_eq!(anchor.seq_num, 101);
    assert_eq!(anchor.signer, SignerKind::Kiak);
    let details = anchor.details.as_ref().expect("details");
    assert_eq!(details["to_seq"], 100);
    assert!(details["external_anchor"].is_null());
    assert_eq!(
        kms.get_audit_state().expect("state").last_anchor_seq,
        anchor.seq_num
    );

    let report = kms.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);
}

#[test]
fn reset_restarts_the_chain() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    kms.reset().expect("reset");

    let entries = kms.get_audit_log(0, None).expect("log");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].op, "boot");
    assert_eq!(entries[0].seq_num, 0);
    assert_eq!(entries[0].details.as_ref().unwrap()["reset"], true);
    assert!(!kms.is_setup().expect("is_setup").is_setup);
}

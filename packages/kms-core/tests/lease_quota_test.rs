mod common;

use ats_kms_core::error::KmsError;
use ats_kms_core::lease::CreateLeaseRequest;
use ats_kms_core::quota::QuotaConfig;
use ats_kms_core::types::{Credential, Endpoint, LeaseId, UserId};
use ats_kms_core::vapid::IssueVapidJwtRequest;
use common::{booted_kms, TestKms};

const PASSPHRASE: &str = "correct horse battery staple";

fn credential() -> Credential {
    Credential::Passphrase {
        passphrase: PASSPHRASE.to_string(),
    }
}

fn endpoint(eid: &str) -> Endpoint {
    Endpoint {
        url: format!("https://push.example/send/{eid}"),
        aud: "https://push.example".to_string(),
        eid: eid.to_string(),
    }
}

fn request(lease_id: &LeaseId, eid: &str) -> IssueVapidJwtRequest {
    IssueVapidJwtRequest {
        lease_id: lease_id.clone(),
        endpoint: endpoint(eid),
        kid: None,
        rid: None,
        jti: None,
    }
}

fn lease_with_quotas(
    kms: &mut TestKms,
    subs: Vec<Endpoint>,
    ttl_hours: u64,
    quotas: Option<QuotaConfig>,
) -> ats_kms_core::lease::LeaseGrant {
    kms.create_lease(CreateLeaseRequest {
        user_id: UserId("u1".to_string()),
        subs,
        ttl_hours,
        credential: credential(),
        kid: None,
        quotas,
    })
    .expect("create lease")
}

#[test]
fn hourly_token_quota_saturates_at_the_limit() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let quotas = QuotaConfig {
        tokens_per_hour: 120,
        sends_per_minute: 10_000,
        burst_sends: 10_000,
        sends_per_minute_per_eid: 10_000,
    };
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 2, Some(quotas));

    for _ in 0..120 {
        kms.issue_vapid_jwt(request(&grant.lease_id, "e1"))
            .expect("issue inside quota");
    }
    let err = kms
        .issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .unwrap_err();
    assert_eq!(err.code(), "quota.exceeded.lease");
    let retry = err.retry_after_ms().expect("retry_after_ms");
    assert!(retry > 0);
}

#[test]
fn per_endpoint_quota_is_enforced_independently() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let quotas = QuotaConfig {
        tokens_per_hour: 10_000,
        sends_per_minute: 10_000,
        burst_sends: 10_000,
        sends_per_minute_per_eid: 5,
    };
    let grant = lease_with_quotas(
        &mut kms,
        vec![endpoint("e1"), endpoint("e2")],
        2,
        Some(quotas),
    );

    for _ in 0..5 {
        kms.issue_vapid_jwt(request(&grant.lease_id, "e1"))
            .expect("issue inside quota");
    }
    let err = kms
        .issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .unwrap_err();
    assert_eq!(err.code(), "quota.exceeded.endpoint");

    // The second endpoint still has headroom.
    kms.issue_vapid_jwt(request(&grant.lease_id, "e2"))
        .expect("other endpoint issues");
}

#[test]
fn quota_window_drains_over_time() {
    let (mut kms, _storage, clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let quotas = QuotaConfig {
        tokens_per_hour: 10_000,
        sends_per_minute: 3,
        burst_sends: 10_000,
        sends_per_minute_per_eid: 10_000,
    };
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 2, Some(quotas));

    for _ in 0..3 {
        kms.issue_vapid_jwt(request(&grant.lease_id, "e1"))
            .expect("issue inside quota");
    }
    let err = kms
        .issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .unwrap_err();
    assert_eq!(err.code(), "quota.exceeded.lease");

    clock.advance(61_000);
    kms.issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .expect("window drained");
}

#[test]
fn jti_replay_is_rejected_without_new_audit_entry() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    let mut req = request(&grant.lease_id, "e1");
    req.jti = Some("0b9e5f0a-7e1c-4a8e-9b6e-3d2f1c0a9b8e".to_string());
    kms.issue_vapid_jwt(req.clone()).expect("first issue");

    let seq_before = kms.get_audit_state().expect("state").next_seq_num;
    let err = kms.issue_vapid_jwt(req).unwrap_err();
    assert_eq!(err.code(), "jti.collision");
    assert_eq!(
        kms.get_audit_state().expect("state").next_seq_num,
        seq_before
    );
}

#[test]
fn batch_issue_staggers_expiries() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    let batch = kms
        .issue_vapid_jwts(request(&grant.lease_id, "e1"), 3)
        .expect("batch");
    assert_eq!(batch.len(), 3);
    let exps: Vec<u64> = batch.iter().map(|t| t.exp_ms / 1000).collect();
    // stagger = 0.6 * 900 = 540 s between consecutive expiries.
    assert_eq!(exps[1] - exps[0], 540);
    assert_eq!(exps[2] - exps[1], 540);
    for token in &batch {
        let payload = token.jwt.split('.').nth(1).unwrap();
        let payload: serde_json::Value = serde_json::from_slice(
            &ats_kms_core::canonical::b64u_decode(payload).unwrap(),
        )
        .unwrap();
        let iat = payload["iat"].as_u64().unwrap();
        let exp = payload["exp"].as_u64().unwrap();
        assert_eq!(exp - iat, 900);
    }

    assert!(kms
        .issue_vapid_jwts(request(&grant.lease_id, "e1"), 11)
        .is_err());
}

#[test]
fn revoked_lease_refuses_issuance() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    let outcome = kms.revoke_lease(&grant.lease_id).expect("revoke");
    assert_eq!(outcome.status, "revoked");
    assert!(outcome.effective_at_ms > 0);

    let err = kms
        .issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .unwrap_err();
    assert!(matches!(err, KmsError::LeaseRevoked));

    let entries = kms.get_audit_log(0, None).expect("log");
    assert!(entries.iter().any(|e| e.op == "lease:revoke"));
    let report = kms.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);
}

#[test]
fn expired_lease_refuses_and_prunes() {
    let (mut kms, storage, clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    clock.advance(2 * 60 * 60 * 1000);
    let err = kms
        .issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .unwrap_err();
    assert!(matches!(err, KmsError::LeaseExpired));

    let pruned = kms.prune_expired_leases().expect("prune");
    assert_eq!(pruned, 1);
    assert!(storage
        .get_raw("kms", &format!("meta:sessionkek:{}", grant.lease_id.0))
        .is_none());
    let entries = kms.get_audit_log(0, None).expect("log");
    assert!(entries.iter().any(|e| e.op == "lease:expire"));
    // A second sweep is a no-op.
    assert_eq!(kms.prune_expired_leases().expect("prune again"), 0);

    let report = kms.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);
}

#[test]
fn extend_is_bounded_to_24_hours_total() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    let extended = kms.extend_lease(&grant.lease_id, 2).expect("extend");
    assert!(extended > grant.exp_ms);

    let capped = kms.extend_lease(&grant.lease_id, 100).expect("extend far");
    let entries = kms.get_audit_log(0, None).expect("log");
    let create = entries
        .iter()
        .find(|e| e.op == "lease:create")
        .expect("create entry");
    assert!(capped <= create.timestamp_ms + 24 * 60 * 60 * 1000 + 1_000);

    assert!(kms.extend_lease(&grant.lease_id, 1).expect("extend again") == capped);
}

#[test]
fn unknown_endpoint_and_aud_mismatch() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    let err = kms
        .issue_vapid_jwt(request(&grant.lease_id, "e9"))
        .unwrap_err();
    assert!(matches!(err, KmsError::EndpointNotInLease));

    let mut req = request(&grant.lease_id, "e1");
    req.endpoint.aud = "https://other.example".to_string();
    let err = kms.issue_vapid_jwt(req).unwrap_err();
    assert!(matches!(err, KmsError::AudMismatch));

    let mut req = request(&grant.lease_id, "e1");
    req.endpoint.eid = String::new();
    let err = kms.issue_vapid_jwt(req).unwrap_err();
    assert!(matches!(err, KmsError::EidUnknown));

    let err = kms
        .issue_vapid_jwt(request(&LeaseId("missing".to_string()), "e1"))
        .unwrap_err();
    assert!(matches!(err, KmsError::LeaseNotFound));
}

#[test]
fn session_kek_survives_cache_loss() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let grant = lease_with_quotas(&mut kms, vec![endpoint("e1")], 1, None);

    // Simulate a process restart by clearing the in-memory cache; the
    // persisted opaque handle must still serve issuance.
    kms.drop_session_kek_cache();
    kms.issue_vapid_jwt(request(&grant.lease_id, "e1"))
        .expect("issue after cache loss");
}

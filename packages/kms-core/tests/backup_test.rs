mod common;

use ats_kms_core::backup::ImportOptions;
use ats_kms_core::kms::Kms;
use ats_kms_core::types::Credential;
use ats_kms_core::vapid::verify_es256_jwt;
use common::{booted_kms, new_kms_with_seed, MemStorage, SeededEntropy, TestAuthenticator, TestClock};

const PASSPHRASE: &str = "correct horse battery staple";
const BACKUP_PASSWORD: &str = "BackupPhrase-9xQ";

fn credential() -> Credential {
    Credential::Passphrase {
        passphrase: PASSPHRASE.to_string(),
    }
}

#[test]
fn backup_roundtrip_restores_signing_and_audit() {
    let (mut kms, _storage, clock) = booted_kms();
    let setup = kms.setup_passphrase(PASSPHRASE).expect("setup");

    let bundle = kms
        .export_backup(&credential(), BACKUP_PASSWORD, true)
        .expect("export");
    assert_eq!(bundle.version, 2);
    assert_eq!(bundle.metadata.enrollment_count, 1);
    assert!(bundle.metadata.key_count >= 2);
    assert!(bundle.audit_log.is_some());

    // A fresh instance over an empty store stands in for the wiped device.
    let (mut restored, _storage2, clock2) = new_kms_with_seed(99);
    clock2.advance(clock.current().saturating_sub(clock2.current()));
    restored.initialize(common::operate()).expect("initialize");
    restored
        .import_backup(
            &bundle,
            BACKUP_PASSWORD,
            ImportOptions {
                credential: credential(),
                wipe_existing: true,
            },
        )
        .expect("import");

    let report = restored.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);
    let entries = restored.get_audit_log(0, None).expect("log");
    assert!(entries.iter().any(|e| e.op == "backup:import"));

    let now_s = clock2.current() / 1000;
    let payload = serde_json::json!({
        "aud": "https://fcm.googleapis.com",
        "sub": "mailto:ops@ats.example",
        "iat": now_s,
        "exp": now_s + 300,
    });
    let jwt = restored
        .sign_jwt(&setup.vapid_kid, payload, &credential())
        .expect("sign after import");
    assert!(verify_es256_jwt(&jwt, &setup.vapid_pub_raw));
}

#[test]
fn wrong_backup_password_fails_closed() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let bundle = kms
        .export_backup(&credential(), BACKUP_PASSWORD, false)
        .expect("export");

    let (mut restored, _s, _c) = new_kms_with_seed(7);
    restored.initialize(common::operate()).expect("initialize");
    let err = restored
        .import_backup(
            &bundle,
            "not the password",
            ImportOptions {
                credential: credential(),
                wipe_existing: true,
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "aad.mismatch");
}

#[test]
fn export_requires_a_real_backup_password() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    assert!(kms.export_backup(&credential(), "short", true).is_err());
}

#[test]
fn bundle_without_audit_log_imports_with_fresh_chain() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let bundle = kms
        .export_backup(&credential(), BACKUP_PASSWORD, false)
        .expect("export");
    assert!(bundle.audit_log.is_none());
    assert_eq!(bundle.metadata.audit_entry_count, 0);

    let (mut restored, _s, _c) = new_kms_with_seed(21);
    restored.initialize(common::operate()).expect("initialize");
    restored
        .import_backup(
            &bundle,
            BACKUP_PASSWORD,
            ImportOptions {
                credential: credential(),
                wipe_existing: true,
            },
        )
        .expect("import");

    let entries = restored.get_audit_log(0, None).expect("log");
    assert_eq!(entries[0].op, "boot");
    assert!(entries.iter().any(|e| e.op == "backup:import"));
    let report = restored.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);

    // The restored instance still answers for the original enrollment.
    assert!(restored.is_setup().expect("is_setup").is_setup);
}

#[test]
fn import_refuses_to_clobber_without_wipe_flag() {
    let (mut kms, _storage, _clock) = booted_kms();
    kms.setup_passphrase(PASSPHRASE).expect("setup");
    let bundle = kms
        .export_backup(&credential(), BACKUP_PASSWORD, false)
        .expect("export");

    let storage = MemStorage::default();
    let clock = TestClock::new(1_750_000_000_000);
    let mut other = Kms::new(
        storage,
        clock,
        SeededEntropy::new(33),
        TestAuthenticator::default(),
        common::test_config(),
    );
    other.initialize(common::operate()).expect("initialize");
    other.setup_passphrase("a different passphrase").expect("setup other");

    let err = other
        .import_backup(
            &bundle,
            BACKUP_PASSWORD,
            ImportOptions {
                credential: credential(),
                wipe_existing: false,
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "internal");
}

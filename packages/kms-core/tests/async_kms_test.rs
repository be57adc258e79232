mod common;

use ats_kms_core::adapters::{AsyncStorageAdapter, BoxFuture};
use ats_kms_core::async_kms::AsyncKms;
use ats_kms_core::kms::KmsConfig;
use ats_kms_core::lease::CreateLeaseRequest;
use ats_kms_core::types::{Credential, Endpoint, UserId};
use ats_kms_core::vapid::IssueVapidJwtRequest;
use common::{SeededEntropy, TestAuthenticator, TestClock};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

const PASSPHRASE: &str = "correct horse battery staple";

/// Async backing-store double for the single `kms` namespace. Keys stay
/// ordered so pagination is just "everything after the cursor".
#[derive(Clone, Default)]
struct MemAsyncStorage {
    records: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
}

impl MemAsyncStorage {
    fn len(&self) -> usize {
        self.records.borrow().len()
    }

    fn has_key_with_prefix(&self, prefix: &str) -> bool {
        self.records.borrow().keys().any(|key| key.starts_with(prefix))
    }
}

fn expect_kms_namespace(namespace: &str) -> Result<(), String> {
    if namespace == "kms" {
        Ok(())
    } else {
        Err(format!("unexpected namespace: {namespace}"))
    }
}

impl AsyncStorageAdapter for MemAsyncStorage {
    type Error = String;

    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, Self::Error>> {
        Box::pin(async move {
            expect_kms_namespace(namespace)?;
            Ok(self.records.borrow().get(key).cloned())
        })
    }

    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), Self::Error>> {
        Box::pin(async move {
            expect_kms_namespace(namespace)?;
            self.records
                .borrow_mut()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), Self::Error>> {
        Box::pin(async move {
            expect_kms_namespace(namespace)?;
            self.records.borrow_mut().remove(key);
            Ok(())
        })
    }

    fn list_since<'a>(
        &'a self,
        namespace: &'a str,
        cursor: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<(Vec<(String, Vec<u8>)>, String), Self::Error>> {
        Box::pin(async move {
            expect_kms_namespace(namespace)?;
            let records = self.records.borrow();
            let page: Vec<(String, Vec<u8>)> = records
                .iter()
                .filter(|(key, _)| key.as_str() > cursor)
                .take(limit)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let next = page.last().map(|(key, _)| key.clone()).unwrap_or_default();
            Ok((page, next))
        })
    }
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn wake(_: *const ()) {}
    fn wake_by_ref(_: *const ()) {}
    fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // The vtable ignores its data pointer, so null is fine.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn block_on<F: Future>(future: F) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut future = Box::pin(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => {}
        }
    }
}

fn endpoint() -> Endpoint {
    Endpoint {
        url: "https://push.example/send/1".to_string(),
        aud: "https://push.example".to_string(),
        eid: "e1".to_string(),
    }
}

#[test]
fn async_facade_flushes_writes_to_the_backing_store() {
    let backing = MemAsyncStorage::default();
    let clock = TestClock::new(1_750_000_000_000);
    let mut config = KmsConfig::default();
    config.policy.fixed_pbkdf2_iterations = Some(1_000);
    config.policy.backup_kdf_iterations = 1_000;

    let mut kms = block_on(AsyncKms::new(
        backing.clone(),
        clock,
        SeededEntropy::new(5),
        TestAuthenticator::default(),
        config,
    ))
    .expect("construct");

    block_on(kms.initialize(common::operate())).expect("initialize");
    assert!(backing.len() > 0, "boot state must reach the backing store");

    let setup = block_on(kms.setup_passphrase(PASSPHRASE)).expect("setup");
    let credential = Credential::Passphrase {
        passphrase: PASSPHRASE.to_string(),
    };
    let grant = block_on(kms.create_lease(CreateLeaseRequest {
        user_id: UserId("u1".to_string()),
        subs: vec![endpoint()],
        ttl_hours: 1,
        credential: credential.clone(),
        kid: None,
        quotas: None,
    }))
    .expect("lease");

    let issued = block_on(kms.issue_vapid_jwt(IssueVapidJwtRequest {
        lease_id: grant.lease_id.clone(),
        endpoint: endpoint(),
        kid: None,
        rid: None,
        jti: None,
    }))
    .expect("issue");
    assert!(ats_kms_core::vapid::verify_es256_jwt(
        &issued.jwt,
        &setup.vapid_pub_raw
    ));

    let report = kms.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);

    // The backing store saw every record the mirror journaled.
    assert!(backing.has_key_with_prefix("lease:"));
    assert!(backing.has_key_with_prefix("audit:"));
}

#[test]
fn async_facade_reloads_persisted_state() {
    let backing = MemAsyncStorage::default();
    let mut config = KmsConfig::default();
    config.policy.fixed_pbkdf2_iterations = Some(1_000);

    let mut kms = block_on(AsyncKms::new(
        backing.clone(),
        TestClock::new(1_750_000_000_000),
        SeededEntropy::new(5),
        TestAuthenticator::default(),
        config.clone(),
    ))
    .expect("construct");
    block_on(kms.initialize(common::operate())).expect("initialize");
    block_on(kms.setup_passphrase(PASSPHRASE)).expect("setup");
    drop(kms);

    // A second process over the same backing store resumes where the
    // first left off.
    let mut resumed = block_on(AsyncKms::new(
        backing,
        TestClock::new(1_750_000_100_000),
        SeededEntropy::new(6),
        TestAuthenticator::default(),
        config,
    ))
    .expect("construct resumed");
    block_on(resumed.initialize(common::operate())).expect("initialize resumed");

    assert!(resumed.is_setup().expect("is_setup").is_setup);
    let credential = Credential::Passphrase {
        passphrase: PASSPHRASE.to_string(),
    };
    block_on(resumed.generate_vapid(&credential)).expect("unlock after resume");
    let report = resumed.verify_audit_chain().expect("verify");
    assert!(report.valid, "errors: {:?}", report.errors);
}

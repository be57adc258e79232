//! Deterministic in-memory fixtures shared by the integration tests.
#![allow(dead_code)]

use ats_kms_core::adapters::{
    Authenticator, ClockAdapter, EntropyAdapter, GateAssertion, PrfAssertion, StorageAdapter,
};
use ats_kms_core::boot::{AttestationQuorum, BootDecision};
use ats_kms_core::crypto::sha256;
use ats_kms_core::kms::{Kms, KmsConfig};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Sync store double for the single `kms` namespace; ordered keys make
/// `list_since` a plain "everything after the cursor" scan.
#[derive(Clone, Default)]
pub struct MemStorage {
    records: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
}

impl MemStorage {
    pub fn get_raw(&self, _namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.records.borrow().get(key).cloned()
    }

    pub fn put_raw(&self, _namespace: &str, key: &str, value: Vec<u8>) {
        self.records.borrow_mut().insert(key.to_string(), value);
    }
}

impl StorageAdapter for MemStorage {
    type Error = String;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.get_raw(namespace, key))
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.put_raw(namespace, key, value.to_vec());
        Ok(())
    }

    fn delete(&self, _namespace: &str, key: &str) -> Result<(), Self::Error> {
        self.records.borrow_mut().remove(key);
        Ok(())
    }

    fn list_since(
        &self,
        _namespace: &str,
        cursor: &str,
        limit: usize,
    ) -> Result<(Vec<(String, Vec<u8>)>, String), Self::Error> {
        let records = self.records.borrow();
        let page: Vec<(String, Vec<u8>)> = records
            .iter()
            .filter(|(key, _)| key.as_str() > cursor)
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let next = page.last().map(|(key, _)| key.clone()).unwrap_or_default();
        Ok((page, next))
    }
}

/// Wall clock under test control; every read ticks forward so timestamps
/// strictly increase. The tick is adjustable to simulate slow operations.
#[derive(Clone)]
pub struct TestClock {
    now: Rc<Cell<u64>>,
    tick: Rc<Cell<u64>>,
}

impl TestClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
            tick: Rc::new(Cell::new(1)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set_tick(&self, ms: u64) {
        self.tick.set(ms);
    }

    pub fn current(&self) -> u64 {
        self.now.get()
    }
}

impl ClockAdapter for TestClock {
    fn now_ms(&self) -> u64 {
        let now = self.now.get() + self.tick.get();
        self.now.set(now);
        now
    }
}

/// xorshift64-backed deterministic entropy.
#[derive(Clone)]
pub struct SeededEntropy {
    state: Rc<Cell<u64>>,
}

impl SeededEntropy {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(Cell::new(seed.max(1))),
        }
    }
}

impl EntropyAdapter for SeededEntropy {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut x = self.state.get();
        while out.len() < len {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            out.extend_from_slice(&x.to_be_bytes());
        }
        self.state.set(x);
        out.truncate(len);
        out
    }
}

/// Authenticator double: PRF output is a hash over a per-fixture secret
/// and the requested salt, so the same credential re-derives the same KEK.
#[derive(Clone)]
pub struct TestAuthenticator {
    user_verified: Rc<Cell<bool>>,
    pub prf_secret: [u8; 32],
    next_credential: Rc<Cell<u32>>,
}

impl Default for TestAuthenticator {
    fn default() -> Self {
        Self {
            user_verified: Rc::new(Cell::new(true)),
            prf_secret: [7u8; 32],
            next_credential: Rc::new(Cell::new(0)),
        }
    }
}

impl TestAuthenticator {
    /// Shared handle for flipping user verification mid-test.
    pub fn user_verified_handle(&self) -> Rc<Cell<bool>> {
        self.user_verified.clone()
    }
}

impl Authenticator for TestAuthenticator {
    type Error = String;

    fn register(&self, name: &str, _rp_id: &str, _user_id: &str) -> Result<Vec<u8>, Self::Error> {
        let n = self.next_credential.get();
        self.next_credential.set(n + 1);
        Ok(format!("cred-{name}-{n}").into_bytes())
    }

    fn assert_prf(
        &self,
        credential_id: &[u8],
        prf_salt: &[u8],
    ) -> Result<PrfAssertion, Self::Error> {
        let mut input = Vec::new();
        input.extend_from_slice(&self.prf_secret);
        input.extend_from_slice(credential_id);
        input.extend_from_slice(prf_salt);
        Ok(PrfAssertion {
            user_verified: self.user_verified.get(),
            prf_output: sha256(&input),
        })
    }

    fn assert_gate(&self, _credential_id: &[u8]) -> Result<GateAssertion, Self::Error> {
        Ok(GateAssertion {
            user_verified: self.user_verified.get(),
        })
    }
}

pub type TestKms = Kms<MemStorage, TestClock, SeededEntropy, TestAuthenticator>;

pub fn test_config() -> KmsConfig {
    let mut config = KmsConfig::default();
    config.policy.fixed_pbkdf2_iterations = Some(1_000);
    config.policy.backup_kdf_iterations = 1_000;
    config.platform_hash = "linux/firefox/3".to_string();
    config
}

pub fn new_kms_with_seed(seed: u64) -> (TestKms, MemStorage, TestClock) {
    let storage = MemStorage::default();
    let clock = TestClock::new(1_750_000_000_000);
    let kms = Kms::new(
        storage.clone(),
        clock.clone(),
        SeededEntropy::new(seed),
        TestAuthenticator::default(),
        test_config(),
    );
    (kms, storage, clock)
}

pub fn new_kms() -> (TestKms, MemStorage, TestClock) {
    new_kms_with_seed(42)
}

pub fn operate() -> BootDecision {
    BootDecision::Operate(AttestationQuorum {
        badge_within_ttl: true,
        cached_badge_within_ttl: false,
        manifest_signature_ok: true,
        bundle_hash_matches: true,
    })
}

/// Initialized KMS ready for setup calls.
pub fn booted_kms() -> (TestKms, MemStorage, TestClock) {
    let (mut kms, storage, clock) = new_kms();
    kms.initialize(operate()).expect("initialize");
    (kms, storage, clock)
}

//! Async façade over the sync core for hosts whose store is backed by an
//! async API. The core only ever touches the single `kms` namespace, so
//! the façade keeps a flat in-memory mirror of it: reads are served from
//! the mirror, every mutation is journaled, and the journal drains to the
//! backing store in order after each operation.

use crate::adapters::{
    AsyncStorageAdapter, Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter,
};
use crate::audit::{AuditEntry, AuditState, ChainVerification};
use crate::backup::{BackupBundle, ImportOptions};
use crate::boot::BootDecision;
use crate::error::{KmsError, KmsResult};
use crate::kms::{EnrollmentInfo, IsSetup, Kms, KmsConfig, SetupResult, NAMESPACE};
use crate::lease::{CreateLeaseRequest, LeaseGrant, LeaseInfo, RevokeOutcome};
use crate::types::{Credential, EnrollmentId, Kid, LeaseId};
use crate::vapid::{IssueVapidJwtRequest, IssuedJwt};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

const LOAD_PAGE: usize = 256;

#[derive(Clone, Debug)]
enum JournalOp {
    Put(String, Vec<u8>),
    Delete(String),
}

#[derive(Debug, Default)]
struct MirrorState {
    records: BTreeMap<String, Vec<u8>>,
    journal: Vec<JournalOp>,
}

/// Write-through mirror of the `kms` namespace. The sync core runs
/// entirely against it; anything outside that namespace is a programming
/// error and is rejected rather than silently shadowed.
#[derive(Clone, Debug, Default)]
struct StoreMirror {
    state: Rc<RefCell<MirrorState>>,
}

impl StoreMirror {
    fn preload(&self, records: Vec<(String, Vec<u8>)>) {
        let mut state = self.state.borrow_mut();
        state.records.extend(records);
    }

    fn take_journal(&self) -> Vec<JournalOp> {
        std::mem::take(&mut self.state.borrow_mut().journal)
    }
}

fn check_namespace(namespace: &str) -> Result<(), String> {
    if namespace == NAMESPACE {
        Ok(())
    } else {
        Err(format!("unexpected namespace: {namespace}"))
    }
}

impl StorageAdapter for StoreMirror {
    type Error = String;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        check_namespace(namespace)?;
        Ok(self.state.borrow().records.get(key).cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        check_namespace(namespace)?;
        let mut state = self.state.borrow_mut();
        state.records.insert(key.to_string(), value.to_vec());
        state
            .journal
            .push(JournalOp::Put(key.to_string(), value.to_vec()));
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), Self::Error> {
        check_namespace(namespace)?;
        let mut state = self.state.borrow_mut();
        state.records.remove(key);
        state.journal.push(JournalOp::Delete(key.to_string()));
        Ok(())
    }

    fn list_since(
        &self,
        namespace: &str,
        cursor: &str,
        limit: usize,
    ) -> Result<(Vec<(String, Vec<u8>)>, String), Self::Error> {
        check_namespace(namespace)?;
        let state = self.state.borrow();
        let lower = if cursor.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(cursor)
        };
        let page: Vec<(String, Vec<u8>)> = state
            .records
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let next = page.last().map(|(key, _)| key.clone()).unwrap_or_default();
        Ok((page, next))
    }
}

pub struct AsyncKms<S: AsyncStorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> {
    storage: S,
    mirror: StoreMirror,
    inner: Kms<StoreMirror, C, E, A>,
}

impl<S: AsyncStorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator>
    AsyncKms<S, C, E, A>
{
    pub async fn new(
        storage: S,
        clock: C,
        entropy: E,
        authenticator: A,
        config: KmsConfig,
    ) -> KmsResult<Self> {
        let mirror = StoreMirror::default();
        let mut cursor = String::new();
        loop {
            let (page, next) = storage
                .list_since(NAMESPACE, &cursor, LOAD_PAGE)
                .await
                .map_err(|e| KmsError::Internal(format!("storage list: {e:?}")))?;
            let exhausted = page.len() < LOAD_PAGE || next.is_empty() || next == cursor;
            mirror.preload(page);
            if exhausted {
                break;
            }
            cursor = next;
        }
        let inner = Kms::new(mirror.clone(), clock, entropy, authenticator, config);
        Ok(Self {
            storage,
            mirror,
            inner,
        })
    }

    pub async fn initialize(&mut self, decision: BootDecision) -> KmsResult<()> {
        let result = self.inner.initialize(decision);
        self.drain_journal().await?;
        result
    }

    pub async fn setup_passphrase(&mut self, passphrase: &str) -> KmsResult<SetupResult> {
        let result = self.inner.setup_passphrase(passphrase);
        self.drain_journal().await?;
        result
    }

    pub async fn setup_passkey_prf(
        &mut self,
        name: &str,
        rp_id: &str,
        user_id: &str,
    ) -> KmsResult<SetupResult> {
        let result = self.inner.setup_passkey_prf(name, rp_id, user_id);
        self.drain_journal().await?;
        result
    }

    pub async fn setup_passkey_gate(
        &mut self,
        name: &str,
        rp_id: &str,
        user_id: &str,
        passphrase: &str,
    ) -> KmsResult<SetupResult> {
        let result = self.inner.setup_passkey_gate(name, rp_id, user_id, passphrase);
        self.drain_journal().await?;
        result
    }

    pub async fn add_enrollment(
        &mut self,
        current: &Credential,
        new_credential: Credential,
        name: Option<String>,
        rp_id: Option<String>,
        user_id: Option<String>,
    ) -> KmsResult<EnrollmentId> {
        let result = self
            .inner
            .add_enrollment(current, new_credential, name, rp_id, user_id);
        self.drain_journal().await?;
        result
    }

    pub async fn remove_enrollment(
        &mut self,
        enrollment_id: &EnrollmentId,
        credential: &Credential,
    ) -> KmsResult<()> {
        let result = self.inner.remove_enrollment(enrollment_id, credential);
        self.drain_journal().await?;
        result
    }

    pub async fn change_passphrase(
        &mut self,
        current: &str,
        new_passphrase: &str,
    ) -> KmsResult<()> {
        let result = self.inner.change_passphrase(current, new_passphrase);
        self.drain_journal().await?;
        result
    }

    pub async fn generate_vapid(&mut self, credential: &Credential) -> KmsResult<(Kid, Vec<u8>)> {
        let result = self.inner.generate_vapid(credential);
        self.drain_journal().await?;
        result
    }

    pub fn get_public_key(&self, kid: &Kid) -> KmsResult<Vec<u8>> {
        self.inner.get_public_key(kid)
    }

    pub async fn sign_jwt(
        &mut self,
        kid: &Kid,
        payload: Value,
        credential: &Credential,
    ) -> KmsResult<String> {
        let result = self.inner.sign_jwt(kid, payload, credential);
        self.drain_journal().await?;
        result
    }

    pub async fn create_lease(&mut self, req: CreateLeaseRequest) -> KmsResult<LeaseGrant> {
        let result = self.inner.create_lease(req);
        self.drain_journal().await?;
        result
    }

    pub async fn extend_lease(&mut self, lease_id: &LeaseId, add_hours: u64) -> KmsResult<u64> {
        let result = self.inner.extend_lease(lease_id, add_hours);
        self.drain_journal().await?;
        result
    }

    pub async fn revoke_lease(&mut self, lease_id: &LeaseId) -> KmsResult<RevokeOutcome> {
        let result = self.inner.revoke_lease(lease_id);
        self.drain_journal().await?;
        result
    }

    pub async fn issue_vapid_jwt(&mut self, req: IssueVapidJwtRequest) -> KmsResult<IssuedJwt> {
        let result = self.inner.issue_vapid_jwt(req);
        self.drain_journal().await?;
        result
    }

    pub async fn issue_vapid_jwts(
        &mut self,
        req: IssueVapidJwtRequest,
        count: usize,
    ) -> KmsResult<Vec<IssuedJwt>> {
        let result = self.inner.issue_vapid_jwts(req, count);
        self.drain_journal().await?;
        result
    }

    pub fn get_lease(&self, lease_id: &LeaseId) -> KmsResult<LeaseInfo> {
        self.inner.get_lease(lease_id)
    }

    pub fn list_leases(&self) -> KmsResult<Vec<LeaseInfo>> {
        self.inner.list_leases()
    }

    pub fn is_setup(&self) -> KmsResult<IsSetup> {
        self.inner.is_setup()
    }

    pub fn get_enrollments(&self) -> KmsResult<Vec<EnrollmentInfo>> {
        self.inner.get_enrollments()
    }

    pub fn get_audit_log(&self, from_seq: u64, limit: Option<usize>) -> KmsResult<Vec<AuditEntry>> {
        self.inner.get_audit_log(from_seq, limit)
    }

    pub fn get_audit_state(&self) -> KmsResult<AuditState> {
        self.inner.get_audit_state()
    }

    pub fn get_audit_public_key(&self) -> KmsResult<String> {
        self.inner.get_audit_public_key()
    }

    pub fn verify_audit_chain(&self) -> KmsResult<ChainVerification> {
        self.inner.verify_audit_chain()
    }

    pub async fn rotate_instance_audit_key(&mut self, credential: &Credential) -> KmsResult<()> {
        let result = self.inner.rotate_instance_audit_key(credential);
        self.drain_journal().await?;
        result
    }

    pub async fn reset(&mut self) -> KmsResult<()> {
        let result = self.inner.reset();
        self.drain_journal().await?;
        result
    }

    pub async fn export_backup(
        &mut self,
        credential: &Credential,
        backup_password: &str,
        include_audit: bool,
    ) -> KmsResult<BackupBundle> {
        let result = self
            .inner
            .export_backup(credential, backup_password, include_audit);
        self.drain_journal().await?;
        result
    }

    pub async fn import_backup(
        &mut self,
        bundle: &BackupBundle,
        backup_password: &str,
        options: ImportOptions,
    ) -> KmsResult<()> {
        let result = self.inner.import_backup(bundle, backup_password, options);
        self.drain_journal().await?;
        result
    }

    pub async fn prune_expired_leases(&mut self) -> KmsResult<usize> {
        let result = self.inner.prune_expired_leases();
        self.drain_journal().await?;
        result
    }

    /// Replay the mutation journal against the backing store, oldest
    /// first. A failed write surfaces to the caller; the mirror stays
    /// authoritative for subsequent reads either way.
    async fn drain_journal(&mut self) -> KmsResult<()> {
        for op in self.mirror.take_journal() {
            match op {
                JournalOp::Put(key, value) => self
                    .storage
                    .put(NAMESPACE, &key, &value)
                    .await
                    .map_err(|e| KmsError::Internal(format!("storage put {key}: {e:?}")))?,
                JournalOp::Delete(key) => self
                    .storage
                    .delete(NAMESPACE, &key)
                    .await
                    .map_err(|e| KmsError::Internal(format!("storage delete {key}: {e:?}")))?,
            }
        }
        Ok(())
    }
}

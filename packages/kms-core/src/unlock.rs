//! Scoped acquisition of the master secret and MKEK. `with_unlock` is the
//! single entry point; there is no two-phase lock/unlock API and no
//! persistent unlock state. Cleanup (random-overwrite-then-zero of the MS,
//! MKEK drop, `unlock` audit entry) runs on every exit path.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::audit::{AuditContext, SignerSel};
use crate::canonical::b64u_decode;
use crate::crypto::{scrub, uuid_v4};
use crate::error::{KmsError, KmsResult};
use crate::kdf::{derive_mkek, needs_recalibration, KdfParams};
use crate::kms::Kms;
use crate::master_secret::decrypt_ms;
use crate::types::{Credential, Method};
use serde_json::json;
use zeroize::Zeroizing;

/// Deadline class for the operation run inside the scope.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpClass {
    Default,
    Sign,
    Generate,
    Backup,
}

impl OpClass {
    pub fn timeout_ms(&self) -> u64 {
        match self {
            OpClass::Default => 10_000,
            OpClass::Sign => 5_000,
            OpClass::Generate => 10_000,
            OpClass::Backup => 60_000,
        }
    }
}

/// Everything an operation may touch while the vault is open. The MS and
/// MKEK never leave this struct; accessors hand out borrows only.
pub struct UnlockScope {
    ms: Zeroizing<[u8; 32]>,
    mkek: Zeroizing<[u8; 32]>,
    pub request_id: String,
    pub unlock_time_ms: u64,
    pub method: Method,
    pub enrollment_id: crate::types::EnrollmentId,
    deadline_ms: u64,
}

impl UnlockScope {
    pub fn ms(&self) -> &[u8; 32] {
        &self.ms
    }

    pub fn mkek(&self) -> &[u8; 32] {
        &self.mkek
    }

    /// Cooperative deadline check, consulted between primitive calls. The
    /// scheduling model is single-threaded cooperative; this is the
    /// suspension-point race against the timeout.
    pub fn check_deadline(&self, now_ms: u64) -> KmsResult<()> {
        if now_ms > self.deadline_ms {
            return Err(KmsError::UnlockTimeout {
                elapsed_ms: now_ms.saturating_sub(self.unlock_time_ms),
            });
        }
        Ok(())
    }
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    /// Authenticate, decrypt MS, derive MKEK, run `op`, then clean up.
    ///
    /// Phases:
    /// 1. authenticate: load enrollment, derive KEK, constant-time KCV.
    /// 2. derive MS: AEAD unwrap with the enrollment AAD.
    /// 3. derive MKEK.
    /// 4. operate: run the closure against the deadline.
    /// 5. cleanup: scrub MS/MKEK, emit the `unlock` audit entry.
    ///
    /// Each concurrent unlock owns its own MS copy; no shared lock exists.
    pub fn with_unlock<T, F>(
        &mut self,
        credential: &Credential,
        class: OpClass,
        op: F,
    ) -> KmsResult<T>
    where
        F: FnOnce(&mut Self, &UnlockScope) -> KmsResult<T>,
    {
        self.ensure_operational()?;
        let request_id = uuid_v4(&self.entropy);
        let unlock_time_ms = self.clock.now_ms();

        let outcome = self.unlock_and_run(credential, class, &request_id, unlock_time_ms, op);

        let lock_time_ms = self.clock.now_ms();
        let duration_ms = lock_time_ms.saturating_sub(unlock_time_ms);
        self.emit_unlock_audit(
            credential.method(),
            &request_id,
            unlock_time_ms,
            lock_time_ms,
            duration_ms,
            &outcome,
        );
        match outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::Failed { error } => Err(error),
        }
    }

    fn unlock_and_run<T, F>(
        &mut self,
        credential: &Credential,
        class: OpClass,
        request_id: &str,
        unlock_time_ms: u64,
        op: F,
    ) -> Outcome<T>
    where
        F: FnOnce(&mut Self, &UnlockScope) -> KmsResult<T>,
    {
        // Phase 1: authenticate.
        let (enrollment, derived) = match self.authenticate(credential) {
            Ok(pair) => pair,
            Err(error) => return Outcome::Failed { error },
        };
        if let Err(error) = self.verify_kcv(&enrollment, &derived) {
            return Outcome::Failed { error };
        }

        // Phase 2: derive MS.
        let ms = match self.decrypt_enrollment_ms(&enrollment, &derived.kek) {
            Ok(ms) => ms,
            Err(error) => return Outcome::Failed { error },
        };

        // Phase 3: derive MKEK.
        let mkek = match derive_mkek(&ms) {
            Ok(mkek) => mkek,
            Err(error) => return Outcome::Failed { error },
        };

        let mut scope = UnlockScope {
            ms,
            mkek,
            request_id: request_id.to_string(),
            unlock_time_ms,
            method: enrollment.method,
            enrollment_id: enrollment.id.clone(),
            deadline_ms: unlock_time_ms + class.timeout_ms(),
        };

        // Stale PBKDF2 parameters are refreshed while the MS is in hand.
        if let Err(error) = self.maybe_recalibrate(&enrollment, credential, &scope) {
            self.destroy_scope(&mut scope);
            return Outcome::Failed { error };
        }

        // Phase 4: operate, raced against the deadline.
        let result = op(self, &scope).and_then(|value| {
            scope.check_deadline(self.clock.now_ms()).map(|_| value)
        });

        // Phase 5: cleanup. Non-cancellable. A short-lived MKEK copy is
        // parked so the `unlock` entry can still be UAK-signed after the
        // scope is scrubbed.
        self.pending_unlock_mkek = Some(Zeroizing::new(*scope.mkek()));
        self.destroy_scope(&mut scope);
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(error) => Outcome::Failed { error },
        }
    }

    fn destroy_scope(&mut self, scope: &mut UnlockScope) {
        scrub(&self.entropy, &mut scope.ms[..]);
        scrub(&self.entropy, &mut scope.mkek[..]);
    }

    fn decrypt_enrollment_ms(
        &self,
        enrollment: &crate::master_secret::EnrollmentConfig,
        kek: &[u8; 32],
    ) -> KmsResult<Zeroizing<[u8; 32]>> {
        decrypt_ms(
            &b64u_decode(&enrollment.encrypted_ms)?,
            kek,
            &b64u_decode(&enrollment.iv)?,
            &b64u_decode(&enrollment.aad)?,
        )
    }

    fn emit_unlock_audit<T>(
        &mut self,
        method: Method,
        request_id: &str,
        unlock_time_ms: u64,
        lock_time_ms: u64,
        duration_ms: u64,
        outcome: &Outcome<T>,
    ) {
        let mut details = json!({ "method": method.as_str() });
        if method == Method::PasskeyGate {
            details["gate_only"] = json!(true);
        }
        if let Outcome::Failed { error } = outcome {
            details["error"] = json!(error.code());
        }
        let signer = match self.pending_unlock_mkek.take() {
            Some(mkek) if self.uak_exists() => SignerSel::User(mkek),
            _ => SignerSel::Instance,
        };
        let ctx = AuditContext {
            request_id: request_id.to_string(),
            unlock_time_ms: Some(unlock_time_ms),
            lock_time_ms: Some(lock_time_ms),
            duration_ms: Some(duration_ms),
            details: Some(details),
            ..AuditContext::default()
        };
        if let Err(e) = self.append_audit("unlock", ctx, signer) {
            tracing::warn!(error = %e, "failed to append unlock audit entry");
        }
    }

    fn maybe_recalibrate(
        &mut self,
        enrollment: &crate::master_secret::EnrollmentConfig,
        credential: &Credential,
        scope: &UnlockScope,
    ) -> KmsResult<()> {
        let KdfParams::Pbkdf2 { last_calibrated_at, platform_hash, .. } = &enrollment.kdf_params
        else {
            return Ok(());
        };
        let now = self.clock.now_ms();
        if !needs_recalibration(*last_calibrated_at, platform_hash, &self.config.platform_hash, now)
        {
            return Ok(());
        }
        let Credential::Passphrase { .. } = credential else {
            return Ok(());
        };
        scope.check_deadline(self.clock.now_ms())?;

        let prepared = self.prepare_new_kek(&enrollment.id, credential, None, None)?;
        let mut meta = self.load_ms_meta()?;
        meta.ms_version += 1;
        meta.updated_at = now;
        let mut refreshed = self.persist_enrollment(
            prepared,
            enrollment.method,
            scope.ms(),
            meta.ms_version,
            enrollment.name.clone(),
            enrollment.rp_id.clone(),
            enrollment.user_id.clone(),
            enrollment.id.clone(),
        )?;
        refreshed.created_at = enrollment.created_at;
        self.save_enrollment(&refreshed)?;
        self.save_ms_meta(&meta)?;
        tracing::debug!(enrollment = %enrollment.id.0, "recalibrated pbkdf2 parameters");
        let ctx = AuditContext {
            request_id: scope.request_id.clone(),
            details: Some(json!({ "ms_version": meta.ms_version })),
            ..AuditContext::default()
        };
        let mkek = Zeroizing::new(*scope.mkek());
        let signer = if self.uak_exists() {
            SignerSel::User(mkek)
        } else {
            SignerSel::Instance
        };
        self.append_audit("enrollment:recalibrate", ctx, signer)?;
        Ok(())
    }
}

enum Outcome<T> {
    Ok(T),
    Failed { error: KmsError },
}

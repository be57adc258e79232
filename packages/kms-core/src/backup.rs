//! Sealed backup bundle export/import (schema v2). The bundle carries the
//! MS under a dedicated PBKDF2-derived backup KEK, the enrollment records
//! verbatim, every wrapped application key, and optionally the audit log
//! with its signer public keys.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::audit::{AuditContext, AuditEntry, AuditState, SignerSel};
use crate::canonical::{aad_backup, b64u, b64u_decode};
use crate::crypto::uuid_v4;
use crate::error::{KmsError, KmsResult};
use crate::kdf::derive_kek_pbkdf2;
use crate::keywrap::{KeySummary, WrappedApplicationKey};
use crate::kms::{keys, Kms};
use crate::master_secret::{decrypt_ms, encrypt_ms, EnrollmentConfig, EnrollmentSummary, MsMeta};
use crate::types::Credential;
use crate::unlock::OpClass;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

pub const BUNDLE_VERSION: u64 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupKdf {
    pub alg: String,
    pub iterations: u32,
    pub salt: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupMs {
    pub ct: String,
    pub iv: String,
    pub aad: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupAudit {
    pub entries: Vec<AuditEntry>,
    pub audit_public_keys: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub ms_version: u64,
    pub enrollment_count: usize,
    pub key_count: usize,
    pub audit_entry_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupBundle {
    pub version: u64,
    pub bundle_id: String,
    pub created_at_ms: u64,
    pub exported_from: String,
    pub backup_kdf: BackupKdf,
    pub encrypted_ms: BackupMs,
    pub enrollments: Vec<EnrollmentConfig>,
    pub wrapped_keys: Vec<WrappedApplicationKey>,
    pub audit_log: Option<BackupAudit>,
    pub metadata: BackupMetadata,
}

#[derive(Clone, Debug)]
pub struct ImportOptions {
    /// Credential for one of the bundle's enrollments; authorizes the
    /// post-restore audit entry and re-certifies the fresh KIAK.
    pub credential: Credential,
    /// Required when the store already holds data.
    pub wipe_existing: bool,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    /// Export a sealed bundle inside an unlock scope.
    pub fn export_backup(
        &mut self,
        credential: &Credential,
        backup_password: &str,
        include_audit: bool,
    ) -> KmsResult<BackupBundle> {
        if backup_password.len() < 8 {
            return Err(KmsError::UnlockDenied);
        }
        let backup_password = backup_password.to_string();
        self.with_unlock(credential, OpClass::Backup, move |kms, scope| {
            let bundle_id = uuid_v4(&kms.entropy);
            let now = kms.clock.now_ms();
            let salt = kms.entropy.random_bytes(16);
            let iterations = kms.config.policy.backup_kdf_iterations;
            let derived = derive_kek_pbkdf2(
                &kms.entropy,
                backup_password.as_bytes(),
                &salt,
                iterations,
            );
            scope.check_deadline(kms.clock.now_ms())?;

            let aad = aad_backup(&bundle_id)?;
            let (ct, iv) = encrypt_ms(&kms.entropy, scope.ms(), &derived.kek, &aad)?;

            let enrollments: Vec<EnrollmentConfig> = kms
                .load_enrollment_index()?
                .iter()
                .map(|summary| kms.load_enrollment(&summary.id))
                .collect::<KmsResult<_>>()?;
            let wrapped_keys: Vec<WrappedApplicationKey> = kms
                .load_key_index()?
                .iter()
                .map(|summary| kms.load_key(&summary.kid))
                .collect::<KmsResult<_>>()?;
            let audit_log = if include_audit {
                Some(BackupAudit {
                    entries: kms.collect_audit_entries(0, None)?,
                    audit_public_keys: kms.audit_pubkeys()?,
                })
            } else {
                None
            };
            let meta = kms.load_ms_meta()?;

            let bundle = BackupBundle {
                version: BUNDLE_VERSION,
                bundle_id: bundle_id.clone(),
                created_at_ms: now,
                exported_from: kms.config.platform_hash.clone(),
                backup_kdf: BackupKdf {
                    alg: "PBKDF2-HMAC-SHA256".to_string(),
                    iterations,
                    salt: b64u(&salt),
                },
                encrypted_ms: BackupMs {
                    ct: b64u(&ct),
                    iv: b64u(&iv),
                    aad: b64u(&aad),
                },
                metadata: BackupMetadata {
                    ms_version: meta.ms_version,
                    enrollment_count: enrollments.len(),
                    key_count: wrapped_keys.len(),
                    audit_entry_count: audit_log
                        .as_ref()
                        .map(|a| a.entries.len())
                        .unwrap_or(0),
                },
                enrollments,
                wrapped_keys,
                audit_log,
            };

            let ctx = AuditContext {
                request_id: scope.request_id.clone(),
                details: Some(json!({
                    "bundle_id": bundle_id,
                    "include_audit": include_audit,
                })),
                ..AuditContext::default()
            };
            let mkek = zeroize::Zeroizing::new(*scope.mkek());
            kms.append_audit("backup:export", ctx, SignerSel::User(mkek))?;
            Ok(bundle)
        })
    }

    /// Restore a bundle: verify the backup password against the sealed MS,
    /// wipe, rewrite every record, rebuild audit state, then continue the
    /// chain under the restored UAK.
    pub fn import_backup(
        &mut self,
        bundle: &BackupBundle,
        backup_password: &str,
        options: ImportOptions,
    ) -> KmsResult<()> {
        self.ensure_operational()?;
        if bundle.version != BUNDLE_VERSION {
            return Err(KmsError::ConfigCorrupted(format!(
                "unsupported bundle version {}",
                bundle.version
            )));
        }
        if !self.load_enrollment_index()?.is_empty() && !options.wipe_existing {
            return Err(KmsError::Internal(
                "store is not empty; wipe_existing required".to_string(),
            ));
        }

        // Prove the password and the bundle's integrity before touching
        // the store.
        let derived = derive_kek_pbkdf2(
            &self.entropy,
            backup_password.as_bytes(),
            &b64u_decode(&bundle.backup_kdf.salt)?,
            bundle.backup_kdf.iterations,
        );
        let _ms = decrypt_ms(
            &b64u_decode(&bundle.encrypted_ms.ct)?,
            &derived.kek,
            &b64u_decode(&bundle.encrypted_ms.iv)?,
            &b64u_decode(&bundle.encrypted_ms.aad)?,
        )?;

        for key in self.store_list_keys()? {
            self.store_delete(&key)?;
        }
        self.session_keks.clear();
        self.lrk = None;
        self.ensure_lrk_after_wipe()?;
        let kiak = self.ensure_kiak()?;

        self.save_ms_meta(&MsMeta {
            ms_version: bundle.metadata.ms_version,
            created_at: bundle.created_at_ms,
            updated_at: self.clock.now_ms(),
        })?;
        let mut enrollment_index = Vec::new();
        for enrollment in &bundle.enrollments {
            self.store_put_json(&keys::enrollment_config(&enrollment.id.0), enrollment)?;
            enrollment_index.push(EnrollmentSummary {
                id: enrollment.id.clone(),
                method: enrollment.method,
                created_at: enrollment.created_at,
            });
        }
        self.save_enrollment_index(&enrollment_index)?;

        let mut key_index = Vec::new();
        let mut uak_ref = None;
        for record in &bundle.wrapped_keys {
            self.store_put_json(&keys::key(&record.kid.0), record)?;
            key_index.push(KeySummary {
                kid: record.kid.clone(),
                purpose: record.purpose,
                alg: record.alg,
                created_at: record.created_at,
            });
            if record.purpose == crate::types::KeyPurpose::AuditUser {
                uak_ref = Some(crate::delegation::UakRef {
                    kid: record.kid.clone(),
                    pub_key: record.public_key_raw.clone(),
                });
            }
        }
        self.store_put_json(keys::KEY_INDEX, &key_index)?;
        let uak_ref = uak_ref
            .ok_or_else(|| KmsError::ConfigCorrupted("bundle missing audit-user key".to_string()))?;
        self.store_put_json(keys::META_UAK, &uak_ref)?;

        if let Some(audit) = &bundle.audit_log {
            let mut registry = audit.audit_public_keys.clone();
            registry.insert(
                crate::crypto::signer_id(&b64u_decode(&kiak.pub_key)?),
                kiak.pub_key.clone(),
            );
            self.store_put_json(keys::AUDIT_PUBKEYS, &registry)?;
            let mut state = AuditState::default();
            for entry in &audit.entries {
                self.store_put_json(&keys::audit_entry(entry.seq_num), entry)?;
                state.next_seq_num = entry.seq_num + 1;
                state.total_entries += 1;
                state.last_timestamp_ms = entry.timestamp_ms;
                state.last_chain_hash = entry.chain_hash.clone();
                if entry.op == "anchor" {
                    state.last_anchor_seq = entry.seq_num;
                }
            }
            self.store_put_json(keys::AUDIT_STATE, &state)?;
        } else {
            self.register_audit_pubkey(&kiak.pub_key)?;
            let ctx = AuditContext {
                request_id: uuid_v4(&self.entropy),
                details: Some(json!({ "first_boot": true, "imported": true })),
                ..AuditContext::default()
            };
            self.append_audit("boot", ctx, SignerSel::Instance)?;
        }
        self.register_audit_pubkey(&uak_ref.pub_key)?;
        self.register_audit_pubkey(&kiak.pub_key)?;

        let bundle_id = bundle.bundle_id.clone();
        let audit_entry_count = bundle.metadata.audit_entry_count;
        let credential = options.credential.clone();
        // Continue the chain under the restored UAK and certify the fresh
        // KIAK for future system entries.
        self.with_unlock(&credential, OpClass::Backup, move |kms, scope| {
            let mut kiak = kms.load_kiak()?;
            let kiak_pub = kiak.pub_key.clone();
            let cert = kms.issue_cert(
                scope.mkek(),
                crate::types::SignerKind::Kiak,
                None,
                Some(kiak.instance_id.0.clone()),
                &kiak_pub,
                vec!["*".to_string()],
                kms.clock.now_ms(),
                None,
            )?;
            kiak.cert = Some(cert);
            kms.store_put_json(keys::META_KIAK, &kiak)?;

            let ctx = AuditContext {
                request_id: scope.request_id.clone(),
                details: Some(json!({
                    "bundle_id": bundle_id,
                    "restored_entries": audit_entry_count,
                })),
                ..AuditContext::default()
            };
            let mkek = zeroize::Zeroizing::new(*scope.mkek());
            kms.append_audit("backup:import", ctx, SignerSel::User(mkek))?;
            Ok(())
        })
    }

    fn ensure_lrk_after_wipe(&mut self) -> KmsResult<()> {
        let raw = self.entropy.random_bytes(32);
        self.store_put_raw(keys::META_LRK, &raw)?;
        self.lrk = Some(zeroize::Zeroizing::new(raw));
        Ok(())
    }
}

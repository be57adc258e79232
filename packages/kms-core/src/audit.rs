//! Tamper-evident audit log: sequenced, hash-chained, Ed25519-signed
//! entries with three-tier signer delegation. The chain hash is computed
//! over the canonical JSON of the entry minus `chain_hash`, `sig`, and
//! `sig_new`; the signature covers the UTF-8 bytes of the chain hash.

use crate::adapters::{Authenticator, ClockAdapter, EntropyAdapter, StorageAdapter};
use crate::canonical::{b64u, b64u_decode, encode_canonical, KMS_VERSION};
use crate::crypto::{ed25519_verify, sha256, signer_id, Ed25519Handle};
use crate::delegation::{DelegationCertificate, KiakRecord};
use crate::error::{KmsError, KmsResult};
use crate::kms::{keys, Kms};
use crate::types::{Kid, LeaseId, SignerKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use zeroize::Zeroizing;

/// `previous_hash` of the genesis entry: 64 hex zeros.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// An anchor entry summarizes the preceding entries every this many.
pub const ANCHOR_INTERVAL: u64 = 100;

const KIAK_STALE_MS: u64 = 90 * 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub kms_version: u64,
    pub seq_num: u64,
    pub timestamp_ms: u64,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub previous_hash: String,
    pub chain_hash: String,
    pub signer: SignerKind,
    pub signer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<DelegationCertificate>,
    pub sig: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig_new: Option<String>,
}

impl AuditEntry {
    /// Canonical form hashed into `chain_hash`: the entry minus
    /// `chain_hash`, `sig`, and `sig_new`.
    pub fn canonical_bytes(&self) -> KmsResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| KmsError::Internal(format!("audit entry encode: {e}")))?;
        if let Value::Object(map) = &mut value {
            map.remove("chain_hash");
            map.remove("sig");
            map.remove("sig_new");
        }
        encode_canonical(&value)
    }

    pub fn compute_chain_hash(&self) -> KmsResult<String> {
        Ok(b64u(&sha256(&self.canonical_bytes()?)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditState {
    pub next_seq_num: u64,
    pub total_entries: u64,
    pub last_timestamp_ms: u64,
    pub last_chain_hash: String,
    pub last_anchor_seq: u64,
}

impl Default for AuditState {
    fn default() -> Self {
        Self {
            next_seq_num: 0,
            total_entries: 0,
            last_timestamp_ms: 0,
            last_chain_hash: GENESIS_HASH.to_string(),
            last_anchor_seq: 0,
        }
    }
}

/// Optional fields attached to an appended entry.
#[derive(Default)]
pub struct AuditContext {
    pub kid: Option<Kid>,
    pub request_id: String,
    pub origin: Option<String>,
    pub lease_id: Option<LeaseId>,
    pub unlock_time_ms: Option<u64>,
    pub lock_time_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub details: Option<Value>,
    pub jti: Option<String>,
}

/// Which signer seals an entry: UAK while an MKEK is in hand, the lease's
/// LAK for lease-scoped entries, KIAK for system events.
pub enum SignerSel {
    User(Zeroizing<[u8; 32]>),
    Lease(LeaseId),
    Instance,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl<S: StorageAdapter, C: ClockAdapter, E: EntropyAdapter, A: Authenticator> Kms<S, C, E, A> {
    pub(crate) fn load_audit_state(&self) -> KmsResult<AuditState> {
        Ok(self
            .store_get_json::<AuditState>(keys::AUDIT_STATE)?
            .unwrap_or_default())
    }

    fn save_audit_state(&self, state: &AuditState) -> KmsResult<()> {
        self.store_put_json(keys::AUDIT_STATE, state)
    }

    pub(crate) fn load_audit_entry(&self, seq: u64) -> KmsResult<AuditEntry> {
        self.store_get_json::<AuditEntry>(&keys::audit_entry(seq))?
            .ok_or_else(|| KmsError::ConfigNotFound(format!("audit:{seq}")))
    }

    /// Append one entry. Reservation, chain computation, and persist happen
    /// under the single-writer `&mut self` discipline, so no sequence
    /// number is ever published ahead of its predecessor.
    pub(crate) fn append_audit(
        &mut self,
        op: &str,
        ctx: AuditContext,
        signer: SignerSel,
    ) -> KmsResult<AuditEntry> {
        let mut state = self.load_audit_state()?;
        let seq_num = state.next_seq_num;
        let previous_hash = if seq_num == 0 {
            GENESIS_HASH.to_string()
        } else {
            state.last_chain_hash.clone()
        };
        let timestamp_ms = self.clock.now_ms();

        let (signer_kind, handle, id, cert) = self.resolve_signer(signer)?;

        let mut entry = AuditEntry {
            kms_version: KMS_VERSION,
            seq_num,
            timestamp_ms,
            op: op.to_string(),
            kid: ctx.kid.map(|k| k.0),
            request_id: ctx.request_id,
            origin: ctx.origin.or_else(|| self.config.origin.clone()),
            lease_id: ctx.lease_id.map(|l| l.0),
            unlock_time_ms: ctx.unlock_time_ms,
            lock_time_ms: ctx.lock_time_ms,
            duration_ms: ctx.duration_ms,
            details: ctx.details,
            jti: ctx.jti,
            previous_hash,
            chain_hash: String::new(),
            signer: signer_kind,
            signer_id: id,
            cert,
            sig: String::new(),
            sig_new: None,
        };
        entry.chain_hash = entry.compute_chain_hash()?;
        entry.sig = b64u(&handle.sign(entry.chain_hash.as_bytes()));

        self.persist_entry(&entry, &mut state)?;
        self.maybe_anchor(&entry, &mut state)?;
        Ok(entry)
    }

    fn persist_entry(&self, entry: &AuditEntry, state: &mut AuditState) -> KmsResult<()> {
        self.store_put_json(&keys::audit_entry(entry.seq_num), entry)?;
        state.next_seq_num = entry.seq_num + 1;
        state.total_entries += 1;
        state.last_timestamp_ms = entry.timestamp_ms;
        state.last_chain_hash = entry.chain_hash.clone();
        self.save_audit_state(state)
    }

    fn resolve_signer(
        &mut self,
        signer: SignerSel,
    ) -> KmsResult<(SignerKind, Ed25519Handle, String, Option<DelegationCertificate>)> {
        match signer {
            SignerSel::User(mkek) => {
                let uak_ref = self.load_uak_ref()?;
                let record = self.load_key(&uak_ref.kid)?;
                let handle = self.unwrap_ed25519(&record, &mkek)?;
                let id = signer_id(&b64u_decode(&uak_ref.pub_key)?);
                Ok((SignerKind::Uak, handle, id, None))
            }
            SignerSel::Lease(lease_id) => {
                let record = self.load_lak(&lease_id)?;
                let handle = self.unwrap_lak(&record)?;
                let id = signer_id(&b64u_decode(&record.pub_key)?);
                Ok((SignerKind::Lak, handle, id, Some(record.cert)))
            }
            SignerSel::Instance => {
                let record = self.load_kiak()?;
                let handle = self.unwrap_kiak(&record)?;
                let id = signer_id(&b64u_decode(&record.pub_key)?);
                Ok((SignerKind::Kiak, handle, id, record.cert.clone()))
            }
        }
    }

    fn maybe_anchor(&mut self, entry: &AuditEntry, state: &mut AuditState) -> KmsResult<()> {
        if entry.seq_num == 0
            || entry.seq_num % ANCHOR_INTERVAL != 0
            || entry.op == "anchor"
        {
            return Ok(());
        }
        let from_seq = state.last_anchor_seq;
        let mut op_counts: BTreeMap<String, u64> = BTreeMap::new();
        for seq in from_seq..=entry.seq_num {
            if let Ok(prior) = self.load_audit_entry(seq) {
                *op_counts.entry(prior.op).or_insert(0) += 1;
            }
        }
        let details = json!({
            "from_seq": from_seq,
            "to_seq": entry.seq_num,
            "op_counts": op_counts,
            // Reserved for external timestamp / transparency-log anchoring.
            "external_anchor": null,
        });
        let ctx = AuditContext {
            request_id: crate::crypto::uuid_v4(&self.entropy),
            details: Some(details),
            ..AuditContext::default()
        };
        let anchor = self.append_audit("anchor", ctx, SignerSel::Instance)?;
        let mut refreshed = self.load_audit_state()?;
        refreshed.last_anchor_seq = anchor.seq_num;
        self.save_audit_state(&refreshed)?;
        *state = refreshed;
        tracing::debug!(seq = anchor.seq_num, "appended audit anchor");
        Ok(())
    }

    /// Dual-signed rotation entry: `sig` under the outgoing KIAK, `sig_new`
    /// under its replacement, proving continuity across the handover.
    pub(crate) fn append_rotation_entry(
        &mut self,
        old: &KiakRecord,
        old_handle: &Ed25519Handle,
        new_handle: &Ed25519Handle,
        new_pub: &str,
    ) -> KmsResult<AuditEntry> {
        let mut state = self.load_audit_state()?;
        let seq_num = state.next_seq_num;
        let previous_hash = if seq_num == 0 {
            GENESIS_HASH.to_string()
        } else {
            state.last_chain_hash.clone()
        };
        let mut entry = AuditEntry {
            kms_version: KMS_VERSION,
            seq_num,
            timestamp_ms: self.clock.now_ms(),
            op: "audit:rotate".to_string(),
            kid: None,
            request_id: crate::crypto::uuid_v4(&self.entropy),
            origin: None,
            lease_id: None,
            unlock_time_ms: None,
            lock_time_ms: None,
            duration_ms: None,
            details: Some(json!({ "new_pub": new_pub })),
            jti: None,
            previous_hash,
            chain_hash: String::new(),
            signer: SignerKind::Kiak,
            signer_id: signer_id(&b64u_decode(&old.pub_key)?),
            cert: old.cert.clone(),
            sig: String::new(),
            sig_new: None,
        };
        entry.chain_hash = entry.compute_chain_hash()?;
        entry.sig = b64u(&old_handle.sign(entry.chain_hash.as_bytes()));
        entry.sig_new = Some(b64u(&new_handle.sign(entry.chain_hash.as_bytes())));
        self.persist_entry(&entry, &mut state)?;
        Ok(entry)
    }

    /// All `vapid:issue` jtis inside the trailing `window_ms`.
    pub(crate) fn recent_jtis(&self, window_ms: u64) -> KmsResult<HashSet<String>> {
        let state = self.load_audit_state()?;
        let cutoff = self.clock.now_ms().saturating_sub(window_ms);
        let mut out = HashSet::new();
        let mut seq = state.next_seq_num;
        while seq > 0 {
            seq -= 1;
            let entry = self.load_audit_entry(seq)?;
            if entry.timestamp_ms < cutoff {
                break;
            }
            if entry.op == "vapid:issue" {
                if let Some(jti) = entry.jti {
                    out.insert(jti);
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn collect_audit_entries(
        &self,
        from_seq: u64,
        limit: Option<usize>,
    ) -> KmsResult<Vec<AuditEntry>> {
        let state = self.load_audit_state()?;
        let mut out = Vec::new();
        for seq in from_seq..state.next_seq_num {
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
            out.push(self.load_audit_entry(seq)?);
        }
        Ok(out)
    }
}

/// Walk the chain from genesis, enforcing sequencing, linkage, hash
/// recomputation, and per-signer signature and certificate rules.
pub fn verify_chain(
    entries: &[AuditEntry],
    uak_pub: Option<&[u8]>,
    kiak_pub: &[u8],
) -> ChainVerification {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut prev_chain_hash = GENESIS_HASH.to_string();
    let mut current_kiak_pub = kiak_pub.to_vec();

    for (i, entry) in entries.iter().enumerate() {
        let i = i as u64;
        if entry.seq_num != i {
            errors.push(format!("Sequence mismatch at {i}: found {}", entry.seq_num));
            continue;
        }
        if entry.previous_hash != prev_chain_hash {
            errors.push(format!("Chain break at {i}: previousHash mismatch"));
        }
        match entry.compute_chain_hash() {
            Ok(recomputed) => {
                if recomputed != entry.chain_hash {
                    errors.push(format!("Hash mismatch at {i}: chainHash does not recompute"));
                }
            }
            Err(e) => errors.push(format!("Unhashable entry at {i}: {e}")),
        }

        let msg = entry.chain_hash.as_bytes();
        let sig = match b64u_decode(&entry.sig) {
            Ok(sig) => sig,
            Err(_) => {
                errors.push(format!("Invalid signature encoding at {i}"));
                prev_chain_hash = entry.chain_hash.clone();
                continue;
            }
        };

        match entry.signer {
            SignerKind::Uak => match uak_pub {
                Some(uak) => {
                    if signer_id(uak) != entry.signer_id {
                        errors.push(format!("Signer id mismatch at {i}"));
                    }
                    if !ed25519_verify(uak, msg, &sig) {
                        errors.push(format!("Bad UAK signature at {i}"));
                    }
                }
                None => errors.push(format!("UAK entry at {i} but no UAK key known")),
            },
            SignerKind::Lak => {
                verify_delegated(entry, uak_pub, msg, &sig, i, &mut errors);
            }
            SignerKind::Kiak => {
                if let Some(cert) = &entry.cert {
                    verify_delegated(entry, uak_pub, msg, &sig, i, &mut errors);
                    if entry.timestamp_ms.saturating_sub(cert.not_before) > KIAK_STALE_MS {
                        warnings.push(format!(
                            "Stale KIAK certificate at {i}: older than 90 days"
                        ));
                    }
                } else if !ed25519_verify(&current_kiak_pub, msg, &sig) {
                    errors.push(format!("Bad KIAK signature at {i}"));
                }
                if entry.op == "audit:rotate" {
                    match rotation_new_pub(entry) {
                        Some(new_pub) => {
                            let sig_new = entry
                                .sig_new
                                .as_deref()
                                .and_then(|s| b64u_decode(s).ok());
                            match sig_new {
                                Some(sig_new) if ed25519_verify(&new_pub, msg, &sig_new) => {
                                    current_kiak_pub = new_pub;
                                }
                                _ => errors.push(format!("Bad rotation signature at {i}")),
                            }
                        }
                        None => errors.push(format!("Rotation entry at {i} missing new key")),
                    }
                }
            }
        }
        prev_chain_hash = entry.chain_hash.clone();
    }

    ChainVerification {
        valid: errors.is_empty(),
        entries: entries.len(),
        errors,
        warnings,
    }
}

fn verify_delegated(
    entry: &AuditEntry,
    uak_pub: Option<&[u8]>,
    msg: &[u8],
    sig: &[u8],
    i: u64,
    errors: &mut Vec<String>,
) {
    let Some(cert) = &entry.cert else {
        errors.push(format!("Delegated entry at {i} missing certificate"));
        return;
    };
    let Some(uak) = uak_pub else {
        errors.push(format!("Delegated entry at {i} but no UAK key known"));
        return;
    };
    if !cert.verify(uak) {
        errors.push(format!("Bad certificate signature at {i}"));
    }
    if !cert.covers(&entry.op) {
        errors.push(format!("Certificate scope does not cover {} at {i}", entry.op));
    }
    if !cert.valid_at(entry.timestamp_ms) {
        errors.push(format!("Certificate validity window excludes entry at {i}"));
    }
    let Ok(delegate_pub) = b64u_decode(&cert.delegate_pub) else {
        errors.push(format!("Invalid delegate key encoding at {i}"));
        return;
    };
    if signer_id(&delegate_pub) != entry.signer_id {
        errors.push(format!("Delegate key does not match signer id at {i}"));
    }
    if !ed25519_verify(&delegate_pub, msg, sig) {
        errors.push(format!("Bad delegated signature at {i}"));
    }
}

fn rotation_new_pub(entry: &AuditEntry) -> Option<Vec<u8>> {
    let new_pub = entry.details.as_ref()?.get("new_pub")?.as_str()?;
    b64u_decode(new_pub).ok()
}

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct LeaseId(pub String);

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Kid(pub String);

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct EnrollmentId(pub String);

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct InstanceId(pub String);

/// Enrollment credential method.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "passphrase")]
    Passphrase,
    #[serde(rename = "passkey-prf")]
    PasskeyPrf,
    #[serde(rename = "passkey-gate")]
    PasskeyGate,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Passphrase => "passphrase",
            Method::PasskeyPrf => "passkey-prf",
            Method::PasskeyGate => "passkey-gate",
        }
    }

    /// Coarse method label for `is_setup`: passkey variants collapse.
    pub fn coarse(&self) -> &'static str {
        match self {
            Method::Passphrase => "passphrase",
            Method::PasskeyPrf | Method::PasskeyGate => "passkey",
        }
    }

    /// Whether a password (and therefore a KCV) is part of the credential.
    pub fn password_bearing(&self) -> bool {
        matches!(self, Method::Passphrase | Method::PasskeyGate)
    }
}

impl TryFrom<&str> for Method {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "passphrase" => Ok(Method::Passphrase),
            "passkey-prf" => Ok(Method::PasskeyPrf),
            "passkey-gate" => Ok(Method::PasskeyGate),
            _ => Err(format!("unknown method: {value}")),
        }
    }
}

/// Purpose of a wrapped application key; unwrap restricts usages to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum KeyPurpose {
    #[serde(rename = "vapid")]
    Vapid,
    #[serde(rename = "audit-user")]
    AuditUser,
    #[serde(rename = "audit-instance")]
    AuditInstance,
    #[serde(rename = "audit-lease")]
    AuditLease,
    #[serde(rename = "identity")]
    Identity,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::Vapid => "vapid",
            KeyPurpose::AuditUser => "audit-user",
            KeyPurpose::AuditInstance => "audit-instance",
            KeyPurpose::AuditLease => "audit-lease",
            KeyPurpose::Identity => "identity",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum KeyAlg {
    #[serde(rename = "ES256")]
    Es256,
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl KeyAlg {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlg::Es256 => "ES256",
            KeyAlg::EdDsa => "EdDSA",
        }
    }
}

/// Which of the three audit signers produced an entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SignerKind {
    #[serde(rename = "UAK")]
    Uak,
    #[serde(rename = "LAK")]
    Lak,
    #[serde(rename = "KIAK")]
    Kiak,
}

impl SignerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerKind::Uak => "UAK",
            SignerKind::Lak => "LAK",
            SignerKind::Kiak => "KIAK",
        }
    }
}

/// A push endpoint bound into a lease.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub aud: String,
    pub eid: String,
}

/// Caller-supplied credential for an unlock. Passkey variants name the
/// WebAuthn credential; the ceremony itself runs through the
/// [`crate::adapters::Authenticator`] collaborator.
#[derive(Clone)]
pub enum Credential {
    Passphrase { passphrase: String },
    PasskeyPrf { credential_id: Vec<u8> },
    PasskeyGate { credential_id: Vec<u8>, passphrase: String },
}

impl Credential {
    pub fn method(&self) -> Method {
        match self {
            Credential::Passphrase { .. } => Method::Passphrase,
            Credential::PasskeyPrf { .. } => Method::PasskeyPrf,
            Credential::PasskeyGate { .. } => Method::PasskeyGate,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Passphrase { .. } => write!(f, "Credential::Passphrase(<redacted>)"),
            Credential::PasskeyPrf { credential_id } => f
                .debug_struct("Credential::PasskeyPrf")
                .field("credential_id_len", &credential_id.len())
                .finish(),
            Credential::PasskeyGate { credential_id, .. } => f
                .debug_struct("Credential::PasskeyGate")
                .field("credential_id_len", &credential_id.len())
                .field("passphrase", &"<redacted>")
                .finish(),
        }
    }
}

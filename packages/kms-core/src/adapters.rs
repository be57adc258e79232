use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Persistent key-value store with atomic per-key semantics. The host is
/// responsible for durability; the core only assumes that a `put` observed
/// by a later `get` is complete.
pub trait StorageAdapter {
    type Error: Debug + Send + Sync + 'static;
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), Self::Error>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), Self::Error>;
    fn list_since(
        &self,
        namespace: &str,
        cursor: &str,
        limit: usize,
    ) -> Result<(Vec<(String, Vec<u8>)>, String), Self::Error>;
}

/// Async mirror of [`StorageAdapter`] for hosts whose store is backed by an
/// async API; consumed by the buffered façade in `async_kms`.
pub trait AsyncStorageAdapter {
    type Error: Debug + Send + Sync + 'static;
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, Self::Error>>;
    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), Self::Error>>;
    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), Self::Error>>;
    fn list_since<'a>(
        &'a self,
        namespace: &'a str,
        cursor: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<(Vec<(String, Vec<u8>)>, String), Self::Error>>;
}

pub trait ClockAdapter {
    fn now_ms(&self) -> u64;
}

pub trait EntropyAdapter {
    fn random_bytes(&self, len: usize) -> Vec<u8>;
}

/// Outcome of a WebAuthn PRF assertion ceremony.
#[derive(Clone)]
pub struct PrfAssertion {
    /// Whether user verification was actually performed.
    pub user_verified: bool,
    /// 32-byte PRF output; input key material for the KEK derivation.
    pub prf_output: [u8; 32],
}

impl Debug for PrfAssertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrfAssertion")
            .field("user_verified", &self.user_verified)
            .field("prf_output", &"<redacted>")
            .finish()
    }
}

/// Outcome of a gate-only WebAuthn assertion (no PRF extension).
#[derive(Clone, Debug)]
pub struct GateAssertion {
    pub user_verified: bool,
}

/// WebAuthn ceremonies, abstracted. Implementations MUST request
/// `userVerification=required`; the core re-checks the reported flag and
/// denies the unlock when verification did not happen.
pub trait Authenticator {
    type Error: Debug + Send + Sync + 'static;

    /// Run a credential-creation ceremony; returns the credential id.
    fn register(&self, name: &str, rp_id: &str, user_id: &str) -> Result<Vec<u8>, Self::Error>;

    /// Run an assertion with the PRF extension evaluated over `prf_salt`.
    fn assert_prf(
        &self,
        credential_id: &[u8],
        prf_salt: &[u8],
    ) -> Result<PrfAssertion, Self::Error>;

    /// Run a plain assertion used only as a gate.
    fn assert_gate(&self, credential_id: &[u8]) -> Result<GateAssertion, Self::Error>;
}

/// Clock over the platform's wall time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl ClockAdapter for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Entropy from the platform CSPRNG. A CSPRNG failure is unrecoverable for
/// a key service, so this adapter treats it as fatal.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEntropy;

impl EntropyAdapter for SystemEntropy {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        getrandom::getrandom(&mut out).expect("platform csprng unavailable");
        out
    }
}

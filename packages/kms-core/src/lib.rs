#![forbid(unsafe_code)]
//! Core of the ATS browser-hosted KMS: master-secret hierarchy, scoped
//! unlock, VAPID lease issuance, and the tamper-evident audit log.

pub mod adapters;
pub mod async_kms;
pub mod audit;
pub mod backup;
pub mod boot;
pub mod canonical;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod kdf;
pub mod keywrap;
pub mod kms;
pub mod lease;
pub mod master_secret;
pub mod quota;
pub mod types;
pub mod unlock;
pub mod vapid;

pub use adapters::*;
pub use async_kms::*;
pub use audit::*;
pub use backup::*;
pub use boot::*;
pub use canonical::*;
pub use crypto::*;
pub use delegation::*;
pub use error::*;
pub use kdf::*;
pub use keywrap::*;
pub use kms::*;
pub use lease::*;
pub use master_secret::*;
pub use quota::*;
pub use types::*;
pub use unlock::*;
pub use vapid::*;

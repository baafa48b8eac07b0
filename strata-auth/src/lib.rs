//! Request authentication for Strata
//!
//! AWS Signature Version 4 in both header and presigned-URL form, backed by a
//! file-based credential store.

pub mod credentials;
pub mod presign;
pub mod sigv4;

pub use credentials::{Credential, CredentialError, CredentialStore};
pub use presign::{is_presigned, presign_url, PresignError, PresignRequest};
pub use sigv4::{SigV4Error, SigV4Verifier, SignableRequest, SigningScope};

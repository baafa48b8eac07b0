//! S3 object API for Strata
//!
//! Buckets and objects live on the local filesystem. Access is decided per
//! request by [`authz::Authorizer`] from bucket ACL documents, per-object
//! sidecar metadata and SigV4 credentials.

pub mod acl;
pub mod authz;
pub mod handlers;
pub mod listing;
pub mod metadata;
pub mod permissions;
pub mod service;
pub mod storage;
pub mod xml;

pub use handlers::{router, S3State};
pub use service::{S3Config, StrataS3};

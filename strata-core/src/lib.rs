//! Core types for Strata
//!
//! This crate provides the error document and request identifiers shared by every
//! Strata crate.

pub mod error;
pub mod fs;
pub mod request_id;

pub use error::{AwsError, ErrorCode};
pub use request_id::RequestId;

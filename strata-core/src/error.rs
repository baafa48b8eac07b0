//! S3 error codes and the XML error document

use quick_xml::escape::escape;
use thiserror::Error;

use crate::request_id::RequestId;

/// S3 error codes returned by Strata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Authorization
    AccessDenied,

    // Malformed requests
    InvalidArgument,
    InvalidBucketName,
    InvalidRequest,
    MalformedAclError,
    MethodNotAllowed,

    // Resources
    NoSuchBucket,
    NoSuchKey,
    BucketAlreadyExists,
    BucketAlreadyOwnedByYou,
    BucketNotEmpty,

    // Server
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidBucketName => "InvalidBucketName",
            Self::InvalidRequest => "InvalidRequest",
            Self::MalformedAclError => "MalformedACLError",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::NoSuchBucket => "NoSuchBucket",
            Self::NoSuchKey => "NoSuchKey",
            Self::BucketAlreadyExists => "BucketAlreadyExists",
            Self::BucketAlreadyOwnedByYou => "BucketAlreadyOwnedByYou",
            Self::BucketNotEmpty => "BucketNotEmpty",
            Self::InternalError => "InternalError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::AccessDenied => 403,
            Self::InvalidArgument
            | Self::InvalidBucketName
            | Self::InvalidRequest
            | Self::MalformedAclError => 400,
            Self::MethodNotAllowed => 405,
            Self::NoSuchBucket | Self::NoSuchKey => 404,
            Self::BucketAlreadyExists | Self::BucketAlreadyOwnedByYou | Self::BucketNotEmpty => {
                409
            }
            Self::InternalError => 500,
        }
    }

    /// Default client-facing message for the code
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::AccessDenied => "Access Denied",
            Self::InvalidArgument => "Invalid Argument",
            Self::InvalidBucketName => "The specified bucket is not valid.",
            Self::InvalidRequest => "Invalid Request",
            Self::MalformedAclError => {
                "The ACL that you provided was not well formed or did not validate."
            }
            Self::MethodNotAllowed => "The specified method is not allowed against this resource.",
            Self::NoSuchBucket => "The specified bucket does not exist",
            Self::NoSuchKey => "The specified key does not exist.",
            Self::BucketAlreadyExists => "The requested bucket name is not available.",
            Self::BucketAlreadyOwnedByYou => {
                "Your previous request to create the named bucket succeeded and you already own it."
            }
            Self::BucketNotEmpty => "The bucket you tried to delete is not empty",
            Self::InternalError => "We encountered an internal error. Please try again.",
        }
    }
}

/// S3-style error
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct AwsError {
    pub code: ErrorCode,
    pub message: String,
    pub resource: Option<String>,
    pub request_id: RequestId,
}

impl AwsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            resource: None,
            request_id: RequestId::new(),
        }
    }

    /// Error carrying the code's stock message
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// The canonical denial. Never carries detail about why access was refused.
    pub fn access_denied() -> Self {
        Self::from_code(ErrorCode::AccessDenied)
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn status(&self) -> u16 {
        self.code.http_status()
    }

    /// Format as S3-style XML error
    pub fn to_xml(&self) -> String {
        let resource_line = self
            .resource
            .as_ref()
            .map(|r| format!("  <Resource>{}</Resource>\n", escape(r)))
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>{}</Code>
  <Message>{}</Message>
{}  <RequestId>{}</RequestId>
  <HostId>{}</HostId>
</Error>"#,
            self.code.as_str(),
            escape(&self.message),
            resource_line,
            self.request_id.id,
            self.request_id.host_id
        )
    }
}

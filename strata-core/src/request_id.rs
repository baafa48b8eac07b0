//! Request identifiers
//!
//! Every response carries two tokens: `x-amz-request-id`, a short upper-case
//! hex id naming the request, and `x-amz-id-2`, an opaque base64 token S3 uses
//! to name the serving host. Error documents repeat them as `RequestId` and
//! `HostId` so clients can quote both in bug reports.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-amz-request-id";
pub const HOST_ID_HEADER: &str = "x-amz-id-2";

const REQUEST_ID_LEN: usize = 16;

/// The identifier pair of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId {
    /// `x-amz-request-id`, `RequestId` in error bodies
    pub id: String,
    /// `x-amz-id-2`, `HostId` in error bodies
    pub host_id: String,
}

impl RequestId {
    pub fn new() -> Self {
        let request = Uuid::new_v4();
        let mut id = request.simple().to_string();
        id.truncate(REQUEST_ID_LEN);
        id.make_ascii_uppercase();

        // The host token embeds the full request uuid so the two can be correlated in logs
        let mut host = request.as_bytes().to_vec();
        host.extend_from_slice(Uuid::new_v4().as_bytes());

        Self {
            id,
            host_id: STANDARD.encode(host),
        }
    }

    /// Fixed id, for tests and replayed responses
    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let host_id = STANDARD.encode(id.as_bytes());
        Self { id, host_id }
    }

    /// Header name and value for each identifier
    pub fn header_pairs(&self) -> [(&'static str, &str); 2] {
        [
            (REQUEST_ID_HEADER, self.id.as_str()),
            (HOST_ID_HEADER, self.host_id.as_str()),
        ]
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

//! XML bodies for S3 responses

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;

use crate::acl::{BucketAcl, BucketPermissions};
use crate::listing::{ListRequest, ListResult};

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const ALL_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AllUsers";

fn timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn optional_element(name: &str, value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => format!("  <{name}>{}</{name}>\n", escape(v)),
        _ => String::new(),
    }
}

/// Format ListBuckets response
pub fn format_list_buckets(owner_id: &str, owner_name: &str, buckets: &[BucketPermissions]) -> String {
    let bucket_entries: String = buckets
        .iter()
        .map(|bucket| {
            format!(
                r#"    <Bucket>
      <Name>{}</Name>
      <CreationDate>{}</CreationDate>
    </Bucket>
"#,
                escape(&bucket.name),
                timestamp(&bucket.creation_date)
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ListAllMyBucketsResult xmlns="{S3_XMLNS}">
  <Owner>
    <ID>{}</ID>
    <DisplayName>{}</DisplayName>
  </Owner>
  <Buckets>
{}  </Buckets>
</ListAllMyBucketsResult>"#,
        escape(owner_id),
        escape(owner_name),
        bucket_entries
    )
}

/// Format ListObjectsV2 response
pub fn format_list_objects(bucket: &str, request: &ListRequest, result: &ListResult) -> String {
    let contents: String = result
        .contents
        .iter()
        .map(|obj| {
            let etag = obj
                .etag
                .as_deref()
                .map(|e| format!("    <ETag>{}</ETag>\n", escape(e)))
                .unwrap_or_default();
            format!(
                r#"  <Contents>
    <Key>{}</Key>
    <LastModified>{}</LastModified>
{}    <Size>{}</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
"#,
                escape(&obj.key),
                timestamp(&obj.last_modified),
                etag,
                obj.size
            )
        })
        .collect();

    let common_prefixes: String = result
        .common_prefixes
        .iter()
        .map(|p| {
            format!(
                "  <CommonPrefixes>\n    <Prefix>{}</Prefix>\n  </CommonPrefixes>\n",
                escape(p)
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="{S3_XMLNS}">
  <Name>{}</Name>
  <Prefix>{}</Prefix>
{}  <MaxKeys>{}</MaxKeys>
  <KeyCount>{}</KeyCount>
  <IsTruncated>{}</IsTruncated>
{}{}{}{}{}</ListBucketResult>"#,
        escape(bucket),
        escape(&request.prefix),
        optional_element("Delimiter", Some(&request.delimiter)),
        request.effective_max_keys(),
        result.key_count,
        result.is_truncated,
        optional_element("ContinuationToken", request.continuation_token.as_deref()),
        optional_element("NextContinuationToken", result.next_continuation_token.as_deref()),
        optional_element("StartAfter", request.start_after.as_deref()),
        contents,
        common_prefixes
    )
}

fn group_grants(acl: BucketAcl) -> Vec<&'static str> {
    let mut permissions = Vec::new();
    if acl.allows_public_read() {
        permissions.push("READ");
    }
    if acl.allows_public_write() {
        permissions.push("WRITE");
    }
    permissions
}

/// Format GetBucketAcl response
///
/// Canonical-user grants come from the document; the canned ACL shows up as
/// `AllUsers` group grants.
pub fn format_access_control_policy(permissions: &BucketPermissions) -> String {
    let mut grants: String = permissions
        .grants
        .iter()
        .map(|grant| {
            format!(
                r#"    <Grant>
      <Grantee xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="CanonicalUser">
        <ID>{}</ID>
        <DisplayName>{}</DisplayName>
      </Grantee>
      <Permission>{}</Permission>
    </Grant>
"#,
                escape(&grant.grantee_id),
                escape(&grant.grantee_display_name),
                grant.permission
            )
        })
        .collect();

    for permission in group_grants(permissions.acl) {
        grants.push_str(&format!(
            r#"    <Grant>
      <Grantee xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="Group">
        <URI>{ALL_USERS_URI}</URI>
      </Grantee>
      <Permission>{permission}</Permission>
    </Grant>
"#
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<AccessControlPolicy xmlns="{S3_XMLNS}">
  <Owner>
    <ID>{}</ID>
    <DisplayName>{}</DisplayName>
  </Owner>
  <AccessControlList>
{}  </AccessControlList>
</AccessControlPolicy>"#,
        escape(&permissions.owner.id),
        escape(&permissions.owner.display_name),
        grants
    )
}

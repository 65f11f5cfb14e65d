//! Provisioning policy of the output bucket.

use serde::Serialize;
use serde_json::{json, Value};

/// Lifecycle rules applied to the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRules {
    /// Remove delete markers that no longer shadow any version.
    pub expired_delete_marker_cleanup: bool,
    /// Days a version is kept after it stops being current.
    pub noncurrent_version_days: u32,
    /// Days after which an unfinished multipart upload is aborted.
    pub abort_incomplete_multipart_days: u32,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        Self {
            expired_delete_marker_cleanup: true,
            noncurrent_version_days: 7,
            abort_incomplete_multipart_days: 7,
        }
    }
}

/// Server-side encryption applied to stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    /// Keys managed by the object store (`AES256`).
    StoreManaged,
}

/// Everything the output bucket is provisioned with, once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketPolicy {
    pub versioned: bool,
    pub block_public_access: bool,
    pub encryption: Encryption,
    pub enforce_tls: bool,
    /// Keep the bucket and its contents when the deployment is torn down.
    pub retain_on_removal: bool,
    pub lifecycle: LifecycleRules,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            versioned: true,
            block_public_access: true,
            encryption: Encryption::StoreManaged,
            enforce_tls: true,
            retain_on_removal: true,
            lifecycle: LifecycleRules::default(),
        }
    }
}

impl BucketPolicy {
    /// S3 `PutBucketLifecycleConfiguration` document.
    pub fn lifecycle_configuration(&self) -> Value {
        let mut rules = Vec::new();

        if self.lifecycle.expired_delete_marker_cleanup {
            rules.push(json!({
                "ID": "expired-delete-markers",
                "Status": "Enabled",
                "Filter": {},
                "Expiration": { "ExpiredObjectDeleteMarker": true }
            }));
        }

        rules.push(json!({
            "ID": "noncurrent-versions",
            "Status": "Enabled",
            "Filter": {},
            "NoncurrentVersionExpiration": {
                "NoncurrentDays": self.lifecycle.noncurrent_version_days
            }
        }));

        rules.push(json!({
            "ID": "incomplete-multipart-uploads",
            "Status": "Enabled",
            "Filter": {},
            "AbortIncompleteMultipartUpload": {
                "DaysAfterInitiation": self.lifecycle.abort_incomplete_multipart_days
            }
        }));

        json!({ "Rules": rules })
    }

    /// Resource policy denying any request not made over TLS.
    pub fn access_policy(&self, bucket: &str) -> Value {
        let mut statements = Vec::new();
        if self.enforce_tls {
            statements.push(json!({
                "Sid": "DenyInsecureTransport",
                "Effect": "Deny",
                "Principal": { "AWS": "*" },
                "Action": "s3:*",
                "Resource": [
                    format!("arn:aws:s3:::{bucket}"),
                    format!("arn:aws:s3:::{bucket}/*")
                ],
                "Condition": { "Bool": { "aws:SecureTransport": "false" } }
            }));
        }
        json!({ "Version": "2012-10-17", "Statement": statements })
    }

    /// All provisioning documents for a bucket.
    pub fn document(&self, bucket: &str) -> Value {
        json!({
            "bucket": bucket,
            "versioning": if self.versioned { "Enabled" } else { "Suspended" },
            "public_access_block": {
                "BlockPublicAcls": self.block_public_access,
                "IgnorePublicAcls": self.block_public_access,
                "BlockPublicPolicy": self.block_public_access,
                "RestrictPublicBuckets": self.block_public_access
            },
            "encryption": {
                "Rules": [{
                    "ApplyServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" }
                }]
            },
            "removal_policy": if self.retain_on_removal { "retain" } else { "destroy" },
            "lifecycle": self.lifecycle_configuration(),
            "policy": self.access_policy(bucket)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_configuration() {
        let doc = BucketPolicy::default().lifecycle_configuration();
        let rules = doc["Rules"].as_array().unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0]["Expiration"]["ExpiredObjectDeleteMarker"], true);
        assert_eq!(rules[1]["NoncurrentVersionExpiration"]["NoncurrentDays"], 7);
        assert_eq!(
            rules[2]["AbortIncompleteMultipartUpload"]["DaysAfterInitiation"],
            7
        );
    }

    #[test]
    fn test_access_policy_denies_plain_http() {
        let doc = BucketPolicy::default().access_policy("bucket");
        let statement = &doc["Statement"][0];
        assert_eq!(statement["Effect"], "Deny");
        assert_eq!(
            statement["Condition"]["Bool"]["aws:SecureTransport"],
            "false"
        );
    }

    #[test]
    fn test_document() {
        let doc = BucketPolicy::default().document("bucket");
        assert_eq!(doc["versioning"], "Enabled");
        assert_eq!(doc["removal_policy"], "retain");
        assert_eq!(doc["public_access_block"]["BlockPublicAcls"], true);
    }
}

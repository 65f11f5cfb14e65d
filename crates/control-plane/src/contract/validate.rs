//! Field-level validation shared by the contract and the provisioner.

use std::fmt;

use serde::Serialize;

use super::descriptor::env;
use super::ContractError;

/// A parsed Secrets Manager secret ARN.
///
/// `arn:<partition>:secretsmanager:<region>:<account>:secret:<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct SecretArn {
    partition: String,
    region: String,
    account: String,
    name: String,
}

impl SecretArn {
    pub fn parse(raw: &str) -> Result<Self, ContractError> {
        let invalid = || ContractError::InvalidSecret(raw.to_string());

        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 7 || parts[0] != "arn" || parts[2] != "secretsmanager" || parts[5] != "secret" {
            return Err(invalid());
        }

        let (partition, region, account, name) = (parts[1], parts[3], parts[4], parts[6]);
        if partition.is_empty() || region.is_empty() {
            return Err(invalid());
        }
        if account.len() != 12 || !account.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if name.is_empty() || !name.chars().all(is_secret_name_char) {
            return Err(invalid());
        }

        Ok(Self {
            partition: partition.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            name: name.to_string(),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource pattern covering every version of this secret.
    ///
    /// Secrets Manager appends a dash and exactly six random characters to
    /// the name in the full ARN. `?` matches one character, so sibling
    /// secrets sharing this name as a prefix stay out of reach.
    pub fn version_family(&self) -> String {
        format!("{}-??????", self)
    }
}

impl fmt::Display for SecretArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:secretsmanager:{}:{}:secret:{}",
            self.partition, self.region, self.account, self.name
        )
    }
}

impl From<SecretArn> for String {
    fn from(arn: SecretArn) -> Self {
        arn.to_string()
    }
}

fn is_secret_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '=' | '.' | '@' | '-')
}

/// Check an S3 bucket name.
pub fn validate_bucket(bucket: &str) -> Result<(), ContractError> {
    let invalid = || ContractError::InvalidBucket(bucket.to_string());

    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(invalid());
    }
    if !bucket
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return Err(invalid());
    }
    let first = bucket.as_bytes()[0];
    let last = bucket.as_bytes()[bucket.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(invalid());
    }
    if bucket.contains("..") {
        return Err(invalid());
    }
    Ok(())
}

/// Normalize an optional key prefix.
///
/// An empty (or all-slash) prefix is treated as absent. Leading and trailing
/// slashes are stripped; every remaining segment must be a plain name.
pub fn normalize_prefix(prefix: Option<&str>) -> Result<Option<String>, ContractError> {
    let Some(raw) = prefix else {
        return Ok(None);
    };

    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }

    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('*') {
            return Err(ContractError::InvalidPrefix(raw.to_string()));
        }
    }

    Ok(Some(trimmed.to_string()))
}

/// Check a logical database name; it becomes part of an environment variable.
pub fn validate_database_name(name: &str) -> Result<(), ContractError> {
    if name.is_empty() {
        return Err(ContractError::EmptyDatabaseName);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContractError::InvalidDatabaseName(name.to_string()));
    }
    // The worker strips these suffixes from PG_DD_DATABASE_* keys.
    let upper = name.to_ascii_uppercase();
    if upper.ends_with(env::SQL_DUMP_SUFFIX) || upper.ends_with(env::SQL_LOAD_SUFFIX) {
        return Err(ContractError::ReservedDatabaseName(name.to_string()));
    }
    Ok(())
}

/// Check a destination identifier; it becomes one key segment.
pub fn validate_destination(database: &str, destination: &str) -> Result<(), ContractError> {
    let ok = !destination.trim().is_empty()
        && !destination.contains('/')
        && !destination.contains("..")
        && !destination.contains('*');
    if ok {
        Ok(())
    } else {
        Err(ContractError::InvalidDestination {
            database: database.to_string(),
            destination: destination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:orcabus/master-rds";

    #[test]
    fn test_parse_secret_arn() {
        let arn = SecretArn::parse(ARN).unwrap();
        assert_eq!(arn.region(), "ap-southeast-2");
        assert_eq!(arn.account(), "123456789012");
        assert_eq!(arn.name(), "orcabus/master-rds");
        assert_eq!(arn.to_string(), ARN);
        assert_eq!(arn.version_family(), format!("{}-??????", ARN));
    }

    #[test]
    fn test_parse_secret_arn_rejects_malformed() {
        for bad in [
            "",
            "rds-master",
            "arn:aws:s3:::bucket",
            "arn:aws:secretsmanager:ap-southeast-2:1234:secret:x",
            "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:",
            "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:*",
        ] {
            assert!(SecretArn::parse(bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn test_validate_bucket() {
        assert!(validate_bucket("orcabus-test-data-843407916570-ap-southeast-2").is_ok());
        assert!(validate_bucket("ab").is_err());
        assert!(validate_bucket("Upper").is_err());
        assert!(validate_bucket("-leading").is_err());
        assert!(validate_bucket("a..b").is_err());
        assert!(validate_bucket("bucket/*").is_err());
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None).unwrap(), None);
        assert_eq!(normalize_prefix(Some("")).unwrap(), None);
        assert_eq!(normalize_prefix(Some("/")).unwrap(), None);
        assert_eq!(
            normalize_prefix(Some("/pg-dd/")).unwrap(),
            Some("pg-dd".to_string())
        );
        assert_eq!(
            normalize_prefix(Some("a/b")).unwrap(),
            Some("a/b".to_string())
        );
        assert!(normalize_prefix(Some("a//b")).is_err());
        assert!(normalize_prefix(Some("a/../b")).is_err());
    }

    #[test]
    fn test_database_name_with_reserved_suffix_rejected() {
        for name in ["x_sql_dump", "X_SQL_LOAD", "metadata_Sql_Dump"] {
            assert_eq!(
                validate_database_name(name),
                Err(ContractError::ReservedDatabaseName(name.to_string()))
            );
        }
        assert!(validate_database_name("sql_dumps").is_ok());
        assert!(validate_database_name("sql_load_x").is_ok());
    }

    #[test]
    fn test_validate_destination() {
        assert!(validate_destination("db", "s3_object").is_ok());
        assert!(validate_destination("db", "").is_err());
        assert!(validate_destination("db", "a/b").is_err());
        assert!(validate_destination("db", "..").is_err());
    }
}

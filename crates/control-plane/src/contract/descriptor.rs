//! Frozen, validated worker environment.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use super::types::{
    ComputeShape, ExportMode, NetworkPlacement, ScratchStorage, WorkerContract,
};
use super::validate::{
    normalize_prefix, validate_bucket, validate_database_name, validate_destination, SecretArn,
};
use super::ContractError;

/// Environment variable names understood by the worker.
pub mod env {
    pub const SECRET: &str = "PG_DD_SECRET";
    pub const BUCKET: &str = "PG_DD_BUCKET";
    pub const DIR: &str = "PG_DD_DIR";
    pub const PREFIX: &str = "PG_DD_PREFIX";
    pub const MODE: &str = "PG_DD_MODE";
    pub const DATABASE: &str = "PG_DD_DATABASE_";
    pub const SQL_DUMP_SUFFIX: &str = "_SQL_DUMP";
    pub const SQL_LOAD_SUFFIX: &str = "_SQL_LOAD";

    // Added per run at dispatch time.
    pub const RUN_ID: &str = "PG_DD_RUN_ID";
    pub const TASK_TOKEN: &str = "PG_DD_TASK_TOKEN";
    pub const CALLBACK_URL: &str = "PG_DD_CALLBACK_URL";
    pub const OUTPUT_PREFIX: &str = "PG_DD_OUTPUT_PREFIX";
}

const MIN_SCRATCH_GIB: u32 = 21;
const MAX_SCRATCH_GIB: u32 = 200;

/// One validated database export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrozenDatabase {
    name: String,
    query: String,
    destination: String,
}

impl FrozenDatabase {
    /// Logical database name as the worker sees it (lowercase).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Suffix of the `PG_DD_DATABASE_*` variables for this database.
    pub fn env_key(&self) -> String {
        self.name.to_ascii_uppercase()
    }
}

/// A validated worker contract.
///
/// Built only through [`WorkerContract::freeze`]; it exposes read accessors
/// and nothing else, so once shared behind an `Arc` it cannot change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerDescriptor {
    databases: Vec<FrozenDatabase>,
    secret: SecretArn,
    bucket: String,
    prefix: Option<String>,
    mode: Option<ExportMode>,
    scratch: ScratchStorage,
    compute: ComputeShape,
    network: NetworkPlacement,
    stop_timeout_secs: u64,
}

impl WorkerContract {
    /// Validate the contract and freeze it into a [`WorkerDescriptor`].
    pub fn freeze(self) -> Result<WorkerDescriptor, ContractError> {
        if self.databases.is_empty() {
            return Err(ContractError::NoDatabases);
        }

        let mut seen = HashSet::new();
        let mut databases = Vec::with_capacity(self.databases.len());
        for entry in self.databases {
            let name = entry.name.trim().to_string();
            validate_database_name(&name)?;

            let name = name.to_ascii_lowercase();
            if !seen.insert(name.clone()) {
                return Err(ContractError::DuplicateDatabase(name));
            }

            let query = entry
                .query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .ok_or_else(|| ContractError::MissingQuery {
                    database: name.clone(),
                })?;

            let destination = entry
                .destination
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .ok_or_else(|| ContractError::MissingDestination {
                    database: name.clone(),
                })?;
            validate_destination(&name, &destination)?;

            databases.push(FrozenDatabase {
                name,
                query,
                destination,
            });
        }

        let secret = match self.secret.as_deref().map(str::trim) {
            None | Some("") => return Err(ContractError::MissingSecret),
            Some(raw) => SecretArn::parse(raw)?,
        };

        let bucket = match self.output.bucket.as_deref().map(str::trim) {
            None | Some("") => return Err(ContractError::MissingBucket),
            Some(raw) => {
                validate_bucket(raw)?;
                raw.to_string()
            }
        };
        let prefix = normalize_prefix(self.output.prefix.as_deref())?;

        if !self.scratch.dir.starts_with('/') || self.scratch.dir.contains("..") {
            return Err(ContractError::InvalidScratch(format!(
                "directory '{}' must be an absolute path",
                self.scratch.dir
            )));
        }
        if !(MIN_SCRATCH_GIB..=MAX_SCRATCH_GIB).contains(&self.scratch.size_gib) {
            return Err(ContractError::InvalidScratch(format!(
                "size {} GiB is outside {}..={} GiB",
                self.scratch.size_gib, MIN_SCRATCH_GIB, MAX_SCRATCH_GIB
            )));
        }

        if self.compute.cpu_units == 0 {
            return Err(ContractError::InvalidCompute(
                "cpu units must be greater than zero".to_string(),
            ));
        }
        if self.compute.memory_mib == 0 {
            return Err(ContractError::InvalidCompute(
                "memory must be greater than zero".to_string(),
            ));
        }

        Ok(WorkerDescriptor {
            databases,
            secret,
            bucket,
            prefix,
            mode: self.mode,
            scratch: self.scratch,
            compute: self.compute,
            network: self.network,
            stop_timeout_secs: self.stop_timeout_secs,
        })
    }
}

impl WorkerDescriptor {
    pub fn databases(&self) -> &[FrozenDatabase] {
        &self.databases
    }

    pub fn secret(&self) -> &SecretArn {
        &self.secret
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Configured key prefix, if any. Never an empty string.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn mode(&self) -> Option<ExportMode> {
        self.mode
    }

    pub fn scratch(&self) -> &ScratchStorage {
        &self.scratch
    }

    pub fn compute(&self) -> &ComputeShape {
        &self.compute
    }

    pub fn network(&self) -> &NetworkPlacement {
        &self.network
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Static part of the worker environment.
    ///
    /// Per-run values (run id, token, callback url, run prefix) are added
    /// by the dispatcher.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(env::SECRET.to_string(), self.secret.to_string());
        vars.insert(env::BUCKET.to_string(), self.bucket.clone());
        vars.insert(env::DIR.to_string(), self.scratch.dir.clone());

        if let Some(prefix) = &self.prefix {
            vars.insert(env::PREFIX.to_string(), prefix.clone());
        }
        if let Some(mode) = self.mode {
            vars.insert(env::MODE.to_string(), mode.to_string());
        }

        for db in &self.databases {
            let key = format!("{}{}", env::DATABASE, db.env_key());
            set_once(
                &mut vars,
                format!("{key}{}", env::SQL_DUMP_SUFFIX),
                db.query.clone(),
            );
            set_once(
                &mut vars,
                format!("{key}{}", env::SQL_LOAD_SUFFIX),
                db.destination.clone(),
            );
            set_once(&mut vars, key, db.name.clone());
        }

        vars
    }
}

/// Names are unique and suffix-free after `freeze`, so no key repeats.
fn set_once(vars: &mut BTreeMap<String, String>, key: String, value: String) {
    let previous = vars.insert(key, value);
    debug_assert!(previous.is_none(), "worker environment key set twice");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::types::{DatabaseExport, OutputLocation};

    const SECRET: &str = "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:rds-master";

    fn contract() -> WorkerContract {
        WorkerContract {
            databases: vec![DatabaseExport::new(
                "filemanager",
                "select * from s3_object order by event_time desc limit 10000",
                "s3_object",
            )],
            secret: Some(SECRET.to_string()),
            output: OutputLocation {
                bucket: Some("orcabus-test-data".to_string()),
                prefix: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_environment_without_prefix() {
        let descriptor = contract().freeze().unwrap();
        let vars = descriptor.environment();

        assert_eq!(vars.get("PG_DD_SECRET").unwrap(), SECRET);
        assert_eq!(vars.get("PG_DD_BUCKET").unwrap(), "orcabus-test-data");
        assert_eq!(vars.get("PG_DD_DIR").unwrap(), "/tmp");
        assert_eq!(vars.get("PG_DD_DATABASE_FILEMANAGER").unwrap(), "filemanager");
        assert_eq!(
            vars.get("PG_DD_DATABASE_FILEMANAGER_SQL_LOAD").unwrap(),
            "s3_object"
        );
        assert!(vars.contains_key("PG_DD_DATABASE_FILEMANAGER_SQL_DUMP"));
        assert!(!vars.contains_key("PG_DD_PREFIX"));
        assert!(!vars.contains_key("PG_DD_MODE"));
    }

    #[test]
    fn test_environment_with_prefix_and_mode() {
        let mut c = contract();
        c.output.prefix = Some("pg-dd".to_string());
        c.mode = Some(ExportMode::CopyCsv);
        let vars = c.freeze().unwrap().environment();

        assert_eq!(vars.get("PG_DD_PREFIX").unwrap(), "pg-dd");
        assert_eq!(vars.get("PG_DD_MODE").unwrap(), "copy-csv");
    }

    #[test]
    fn test_empty_prefix_is_absent() {
        let mut c = contract();
        c.output.prefix = Some(String::new());
        let descriptor = c.freeze().unwrap();
        assert!(descriptor.prefix().is_none());
        assert!(!descriptor.environment().contains_key("PG_DD_PREFIX"));
    }

    #[test]
    fn test_database_name_is_lowercased() {
        let mut c = contract();
        c.databases = vec![DatabaseExport::new("Workflow_Manager", "select 1", "t1")];
        let descriptor = c.freeze().unwrap();
        let db = &descriptor.databases()[0];
        assert_eq!(db.name(), "workflow_manager");
        assert_eq!(db.env_key(), "WORKFLOW_MANAGER");
    }

    #[test]
    fn test_missing_query_rejected() {
        let mut c = contract();
        c.databases = vec![DatabaseExport {
            name: "metadata_manager".to_string(),
            query: None,
            destination: Some("t1".to_string()),
        }];
        assert_eq!(
            c.freeze().unwrap_err(),
            ContractError::MissingQuery {
                database: "metadata_manager".to_string()
            }
        );
    }

    #[test]
    fn test_blank_destination_rejected() {
        let mut c = contract();
        c.databases = vec![DatabaseExport::new("metadata_manager", "select 1", "  ")];
        assert!(matches!(
            c.freeze(),
            Err(ContractError::MissingDestination { .. })
        ));
    }

    #[test]
    fn test_duplicate_database_rejected() {
        let mut c = contract();
        c.databases = vec![
            DatabaseExport::new("filemanager", "select 1", "t1"),
            DatabaseExport::new("FILEMANAGER", "select 2", "t2"),
        ];
        assert_eq!(
            c.freeze().unwrap_err(),
            ContractError::DuplicateDatabase("filemanager".to_string())
        );
    }

    #[test]
    fn test_reserved_suffix_cannot_shadow_another_database() {
        let mut c = contract();
        c.databases = vec![
            DatabaseExport::new("x", "SELECT real", "t1"),
            DatabaseExport::new("x_sql_dump", "SELECT 1", "t2"),
        ];
        assert_eq!(
            c.freeze().unwrap_err(),
            ContractError::ReservedDatabaseName("x_sql_dump".to_string())
        );
    }

    #[test]
    fn test_environment_keys_are_distinct_per_database() {
        let mut c = contract();
        c.databases = vec![
            DatabaseExport::new("x", "SELECT real", "t1"),
            DatabaseExport::new("x_sql", "SELECT 2", "t2"),
            DatabaseExport::new("sql_dump_x", "SELECT 3", "t3"),
        ];
        let vars = c.freeze().unwrap().environment();

        // secret, bucket, dir plus three keys per database
        assert_eq!(vars.len(), 3 + 3 * 3);
        assert_eq!(vars.get("PG_DD_DATABASE_X_SQL_DUMP").unwrap(), "SELECT real");
        assert_eq!(vars.get("PG_DD_DATABASE_X_SQL_SQL_DUMP").unwrap(), "SELECT 2");
        assert_eq!(vars.get("PG_DD_DATABASE_SQL_DUMP_X").unwrap(), "sql_dump_x");
    }

    #[test]
    fn test_no_databases_rejected() {
        let mut c = contract();
        c.databases.clear();
        assert_eq!(c.freeze().unwrap_err(), ContractError::NoDatabases);
    }

    #[test]
    fn test_missing_secret_and_bucket() {
        let mut c = contract();
        c.secret = None;
        assert_eq!(c.freeze().unwrap_err(), ContractError::MissingSecret);

        let mut c = contract();
        c.output.bucket = Some(" ".to_string());
        assert_eq!(c.freeze().unwrap_err(), ContractError::MissingBucket);
    }

    #[test]
    fn test_scratch_bounds() {
        let mut c = contract();
        c.scratch.size_gib = 10;
        assert!(matches!(c.freeze(), Err(ContractError::InvalidScratch(_))));

        let mut c = contract();
        c.scratch.dir = "tmp".to_string();
        assert!(matches!(c.freeze(), Err(ContractError::InvalidScratch(_))));
    }

    #[test]
    fn test_zero_compute_rejected() {
        let mut c = contract();
        c.compute.memory_mib = 0;
        assert!(matches!(c.freeze(), Err(ContractError::InvalidCompute(_))));
    }
}

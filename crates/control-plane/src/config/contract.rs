//! Default worker contract loaded from YAML.

use std::path::Path;

use crate::contract::WorkerContract;
use crate::error::{AppError, AppResult};

/// Read and check a worker contract file.
///
/// The contract is frozen once so a broken file stops the server at
/// startup instead of failing every dispatch.
pub fn load_contract(path: &Path) -> AppResult<WorkerContract> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_contract(&raw)
}

pub fn parse_contract(raw: &str) -> AppResult<WorkerContract> {
    let contract: WorkerContract = serde_yaml::from_str(raw)?;
    contract.clone().freeze()?;
    Ok(contract)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = r#"
databases:
  - name: metadata_manager
    query: select * from app_library
    destination: app_library
  - name: filemanager
    query: select * from s3_object order by sequencer limit 10000
    destination: s3_object
secret: arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:orcabus/master-rds
output:
  bucket: org-pg-dd
  prefix: pg-dd
mode: copy-csv
"#;

    #[test]
    fn test_parse_contract() {
        let contract = parse_contract(CONTRACT).unwrap();
        assert_eq!(contract.databases.len(), 2);
        assert_eq!(contract.output.prefix.as_deref(), Some("pg-dd"));
    }

    #[test]
    fn test_parse_contract_rejects_missing_secret() {
        let raw = CONTRACT.replace(
            "secret: arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:orcabus/master-rds\n",
            "",
        );
        let err = parse_contract(&raw).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_parse_contract_rejects_bad_yaml() {
        let err = parse_contract("databases: [").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn test_example_contract_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/contract.example.yaml");
        let contract = load_contract(&path).unwrap();
        assert_eq!(contract.databases.len(), 4);
    }
}

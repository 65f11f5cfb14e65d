//! Worker contract as submitted by a caller or loaded from configuration.
//!
//! A `WorkerContract` is the unvalidated, serde-friendly form. Required
//! fields are `Option`s on purpose so that an absent value surfaces as a
//! [`ContractError`](super::ContractError) from `freeze` rather than as a
//! deserialization failure.

use serde::{Deserialize, Serialize};

/// Description of what a worker must export and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerContract {
    /// Logical databases to export, in order.
    #[serde(default)]
    pub databases: Vec<DatabaseExport>,

    /// Secret holding the database connection credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Where exported artifacts are written.
    #[serde(default)]
    pub output: OutputLocation,

    /// Export mode passed through to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExportMode>,

    /// Scratch storage available to the worker.
    #[serde(default)]
    pub scratch: ScratchStorage,

    /// Compute shape of the worker instance.
    #[serde(default)]
    pub compute: ComputeShape,

    /// Network placement of the worker instance.
    #[serde(default)]
    pub network: NetworkPlacement,

    /// Grace period between a stop request and a forced kill.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_stop_timeout_secs() -> u64 {
    120
}

impl Default for WorkerContract {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            secret: None,
            output: OutputLocation::default(),
            mode: None,
            scratch: ScratchStorage::default(),
            compute: ComputeShape::default(),
            network: NetworkPlacement::default(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// One logical database and how to export it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseExport {
    /// Logical database name.
    pub name: String,

    /// Query used to read the data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Destination table or key name the export is loaded under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl DatabaseExport {
    /// Convenience constructor for a fully specified entry.
    pub fn new(name: &str, query: &str, destination: &str) -> Self {
        Self {
            name: name.to_string(),
            query: Some(query.to_string()),
            destination: Some(destination.to_string()),
        }
    }
}

/// Output bucket and optional key prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// How the worker produces its artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportMode {
    /// `pg_dump` custom-format archives.
    PgDump,
    /// Gzipped CSV via `COPY`.
    CopyCsv,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PgDump => "pg-dump",
            Self::CopyCsv => "copy-csv",
        }
    }
}

impl std::fmt::Display for ExportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scratch volume mounted into the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScratchStorage {
    /// Mount path, also exported as `PG_DD_DIR`.
    #[serde(default = "default_scratch_dir")]
    pub dir: String,

    /// Size of the volume in GiB.
    #[serde(default = "default_scratch_size")]
    pub size_gib: u32,
}

fn default_scratch_dir() -> String {
    "/tmp".to_string()
}

fn default_scratch_size() -> u32 {
    100
}

impl Default for ScratchStorage {
    fn default() -> Self {
        Self {
            dir: default_scratch_dir(),
            size_gib: default_scratch_size(),
        }
    }
}

/// CPU architecture the worker image is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuArchitecture {
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl CpuArchitecture {
    /// Value of the `kubernetes.io/arch` node label.
    pub fn node_label(&self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::X86_64 => "amd64",
        }
    }
}

/// CPU, memory and architecture of the worker instance.
///
/// CPU is expressed in units where 1024 is one vCPU.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeShape {
    #[serde(default = "default_cpu_units")]
    pub cpu_units: u32,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,

    #[serde(default = "default_architecture")]
    pub architecture: CpuArchitecture,
}

fn default_cpu_units() -> u32 {
    256
}

fn default_memory_mib() -> u32 {
    1024
}

fn default_architecture() -> CpuArchitecture {
    CpuArchitecture::Arm64
}

impl ComputeShape {
    /// CPU expressed in Kubernetes millicores.
    pub fn millicores(&self) -> u32 {
        (u64::from(self.cpu_units) * 1000 / 1024) as u32
    }
}

impl Default for ComputeShape {
    fn default() -> Self {
        Self {
            cpu_units: default_cpu_units(),
            memory_mib: default_memory_mib(),
            architecture: default_architecture(),
        }
    }
}

/// Subnet class the worker is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    PrivateWithEgress,
    PrivateIsolated,
    Public,
}

impl SubnetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrivateWithEgress => "private_with_egress",
            Self::PrivateIsolated => "private_isolated",
            Self::Public => "public",
        }
    }
}

/// Network placement of the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkPlacement {
    #[serde(default = "default_subnet")]
    pub subnet: SubnetKind,

    /// Security groups attached to the worker, in addition to its egress group.
    #[serde(default)]
    pub security_groups: Vec<String>,
}

fn default_subnet() -> SubnetKind {
    SubnetKind::PrivateWithEgress
}

impl Default for NetworkPlacement {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            security_groups: Vec::new(),
        }
    }
}

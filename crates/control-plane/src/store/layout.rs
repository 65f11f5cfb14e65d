//! Run-partitioned key layout of the output store.

use crate::contract::WorkerDescriptor;
use crate::ids::RunId;

/// Computes where a run's artifacts live.
///
/// Keys have the shape `<prefix?>/<run_id>/<destination>/<file>`. Every run
/// writes below its own `<prefix?>/<run_id>/` partition, so concurrent runs
/// never write the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    bucket: String,
    prefix: Option<String>,
}

impl OutputLayout {
    pub fn new(bucket: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    pub fn for_descriptor(descriptor: &WorkerDescriptor) -> Self {
        Self::new(descriptor.bucket(), descriptor.prefix().map(str::to_string))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Key prefix owned by one run, without a trailing slash.
    pub fn run_prefix(&self, run_id: &RunId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{run_id}"),
            None => run_id.to_string(),
        }
    }

    /// Full key of one artifact.
    pub fn artifact_key(&self, run_id: &RunId, destination: &str, file: &str) -> String {
        format!("{}/{destination}/{file}", self.run_prefix(run_id))
    }

    /// `s3://` URI of the run partition.
    pub fn run_uri(&self, run_id: &RunId) -> String {
        format!("s3://{}/{}/", self.bucket, self.run_prefix(run_id))
    }

    /// Object ARN pattern covering exactly the run partition.
    pub fn run_objects_arn(&self, partition: &str, run_id: &RunId) -> String {
        format!("arn:{partition}:s3:::{}/{}/*", self.bucket, self.run_prefix(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_prefix_without_configured_prefix() {
        let layout = OutputLayout::new("bucket", None);
        let run_id = RunId::new();
        assert_eq!(layout.run_prefix(&run_id), run_id.to_string());
        assert_eq!(
            layout.artifact_key(&run_id, "s3_object", "filemanager.csv.gz"),
            format!("{run_id}/s3_object/filemanager.csv.gz")
        );
    }

    #[test]
    fn test_run_prefix_with_configured_prefix() {
        let layout = OutputLayout::new("bucket", Some("pg-dd".to_string()));
        let run_id = RunId::new();
        assert_eq!(layout.run_prefix(&run_id), format!("pg-dd/{run_id}"));
        assert_eq!(layout.run_uri(&run_id), format!("s3://bucket/pg-dd/{run_id}/"));
        assert_eq!(
            layout.run_objects_arn("aws", &run_id),
            format!("arn:aws:s3:::bucket/pg-dd/{run_id}/*")
        );
    }

    #[test]
    fn test_empty_prefix_treated_as_absent() {
        let layout = OutputLayout::new("bucket", Some(String::new()));
        assert!(layout.prefix().is_none());
    }

    #[test]
    fn test_distinct_runs_get_disjoint_partitions() {
        let layout = OutputLayout::new("bucket", Some("pg-dd".to_string()));
        let a = layout.run_prefix(&RunId::new());
        let b = layout.run_prefix(&RunId::new());
        assert!(!a.starts_with(&format!("{b}/")));
        assert!(!b.starts_with(&format!("{a}/")));
        assert_ne!(a, b);
    }
}

//! In-memory model of the output bucket.
//!
//! The control plane never writes artifacts itself; workers do. This model
//! pins down what the provisioned [`BucketPolicy`](super::BucketPolicy)
//! guarantees for run partitions: puts create versions, deletes leave
//! markers, and `sweep` applies the lifecycle rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::policy::LifecycleRules;

#[derive(Debug, Clone)]
enum Entry {
    Object(Vec<u8>),
    DeleteMarker,
}

#[derive(Debug, Clone)]
struct Version {
    id: String,
    entry: Entry,
    /// When this version stopped being current.
    noncurrent_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Upload {
    key: String,
    initiated_at: DateTime<Utc>,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// What a lifecycle sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub noncurrent_versions_expired: usize,
    pub delete_markers_removed: usize,
    pub uploads_aborted: usize,
}

/// A versioned bucket.
#[derive(Debug, Clone)]
pub struct VersionedStore {
    rules: LifecycleRules,
    objects: BTreeMap<String, Vec<Version>>,
    uploads: BTreeMap<String, Upload>,
    next_id: u64,
}

impl VersionedStore {
    pub fn new(rules: LifecycleRules) -> Self {
        Self {
            rules,
            objects: BTreeMap::new(),
            uploads: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("v{:08}", self.next_id)
    }

    fn push(&mut self, key: &str, entry: Entry, now: DateTime<Utc>) -> String {
        let id = self.allocate_id();
        let history = self.objects.entry(key.to_string()).or_default();
        if let Some(current) = history.last_mut() {
            current.noncurrent_since = Some(now);
        }
        history.push(Version {
            id: id.clone(),
            entry,
            noncurrent_since: None,
        });
        id
    }

    /// Store a new current version and return its id.
    pub fn put(&mut self, key: &str, data: impl Into<Vec<u8>>, now: DateTime<Utc>) -> String {
        self.push(key, Entry::Object(data.into()), now)
    }

    /// Place a delete marker on top of the key. Returns the marker id, or
    /// `None` when the key has no history.
    pub fn delete(&mut self, key: &str, now: DateTime<Utc>) -> Option<String> {
        if !self.objects.contains_key(key) {
            return None;
        }
        Some(self.push(key, Entry::DeleteMarker, now))
    }

    /// Current contents of a key; `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        match &self.objects.get(key)?.last()?.entry {
            Entry::Object(data) => Some(data),
            Entry::DeleteMarker => None,
        }
    }

    /// Contents of a specific version.
    pub fn get_version(&self, key: &str, version_id: &str) -> Option<&[u8]> {
        let version = self.objects.get(key)?.iter().find(|v| v.id == version_id)?;
        match &version.entry {
            Entry::Object(data) => Some(data),
            Entry::DeleteMarker => None,
        }
    }

    /// Number of versions (including delete markers) held for a key.
    pub fn version_count(&self, key: &str) -> usize {
        self.objects.get(key).map_or(0, Vec::len)
    }

    /// Keys whose current version is an object.
    pub fn list(&self, prefix: &str) -> Vec<&str> {
        self.objects
            .iter()
            .filter(|(key, history)| {
                key.starts_with(prefix)
                    && matches!(history.last().map(|v| &v.entry), Some(Entry::Object(_)))
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn create_multipart(&mut self, key: &str, now: DateTime<Utc>) -> String {
        let upload_id = format!("upload-{}", self.allocate_id());
        self.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                initiated_at: now,
                parts: BTreeMap::new(),
            },
        );
        upload_id
    }

    /// Add one part; returns false if the upload no longer exists.
    pub fn upload_part(&mut self, upload_id: &str, part: u32, data: impl Into<Vec<u8>>) -> bool {
        match self.uploads.get_mut(upload_id) {
            Some(upload) => {
                upload.parts.insert(part, data.into());
                true
            }
            None => false,
        }
    }

    /// Assemble the parts in order into a new version.
    pub fn complete_multipart(&mut self, upload_id: &str, now: DateTime<Utc>) -> Option<String> {
        let upload = self.uploads.remove(upload_id)?;
        let data: Vec<u8> = upload.parts.into_values().flatten().collect();
        Some(self.put(&upload.key, data, now))
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Apply the lifecycle rules as of `now`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let noncurrent_ttl = Duration::days(i64::from(self.rules.noncurrent_version_days));
        let upload_ttl = Duration::days(i64::from(self.rules.abort_incomplete_multipart_days));

        for history in self.objects.values_mut() {
            let before = history.len();
            history.retain(|v| match v.noncurrent_since {
                Some(since) => now - since < noncurrent_ttl,
                None => true,
            });
            report.noncurrent_versions_expired += before - history.len();

            // A lone delete marker shadows nothing.
            if self.rules.expired_delete_marker_cleanup
                && history.len() == 1
                && matches!(history[0].entry, Entry::DeleteMarker)
            {
                history.clear();
                report.delete_markers_removed += 1;
            }
        }
        self.objects.retain(|_, history| !history.is_empty());

        let before = self.uploads.len();
        self.uploads
            .retain(|_, upload| now - upload.initiated_at < upload_ttl);
        report.uploads_aborted = before - self.uploads.len();

        report
    }
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new(LifecycleRules::default())
    }
}

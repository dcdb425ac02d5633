//! A named metric: one tier archive per tier of its retention policy.
//!
//! # File Layout
//!
//! ```text
//! <data_dir>/<name>/
//! ├── meta.json      <- name, policy, format version
//! ├── tier_0.slab    <- finest tier
//! └── tier_N.slab    <- coarsest tier
//! ```
//!
//! `meta.json` is written last on create and removed first on drop, so a
//! directory without it is the leftover of an interrupted operation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::archive::TierArchive;
use crate::duration::Duration;
use crate::error::{ParseError, Result, StoreError};
use crate::policy::RetentionPolicy;
use crate::query::{self, QueryResult};

/// Metadata file format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in a metric directory.
pub const METADATA_FILE: &str = "meta.json";

/// Metadata written but not yet renamed into place.
const METADATA_TMP_FILE: &str = "meta.json.tmp";

/// Longest accepted metric name.
const MAX_NAME_LEN: usize = 255;

/// Metadata stored in a metric's meta.json file.
#[derive(Debug, Serialize, Deserialize)]
struct MetricMetadata {
    /// Metadata format version.
    version: u32,
    /// Normalized metric name.
    name: String,
    /// Retention policy in canonical text form.
    policy: RetentionPolicy,
    /// Creation time, seconds since the Unix epoch.
    created_at: u64,
}

/// Normalizes a metric name: trimmed and lowercased.
///
/// # Errors
///
/// Returns [`ParseError::MetricName`] if the name is empty, longer than 255
/// characters, does not start with a letter or digit, or contains anything
/// other than letters, digits, `.`, `_` and `-`.
pub fn normalize_name(name: &str) -> Result<String> {
    let normalized = name.trim().to_ascii_lowercase();
    let reject = |reason: &'static str| -> Result<String> {
        Err(ParseError::MetricName {
            name: name.to_string(),
            reason,
        }
        .into())
    };

    if normalized.is_empty() {
        return reject("the name is empty");
    }
    if normalized.len() > MAX_NAME_LEN {
        return reject("the name is longer than 255 characters");
    }
    if !normalized.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return reject("the name must start with a letter or a digit");
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return reject("only letters, digits, '.', '_' and '-' are allowed");
    }
    Ok(normalized)
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// The most recent sample a metric received.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastUpdate {
    /// Sample timestamp in seconds.
    pub timestamp: u64,
    /// Sample value.
    pub value: f64,
}

/// A named collection of tier archives sharing one retention policy.
#[derive(Debug)]
pub struct Metric {
    /// Normalized name; also the directory name.
    name: String,
    /// Retention policy; one archive per tier.
    policy: RetentionPolicy,
    /// Metric directory.
    path: PathBuf,
    /// Archives from finest to coarsest.
    tiers: Vec<TierArchive>,
    /// Flush touched slots before acknowledging an update.
    sync_writes: bool,
}

impl Metric {
    /// Creates the metric's directory and files under `data_dir`.
    ///
    /// `name` must already be normalized with [`normalize_name`]. The
    /// directory must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryAccess`] if the directory already
    /// exists or cannot be made, and [`StoreError`] or
    /// [`crate::error::SlabIoError`] if any file cannot be written. Partially
    /// created files are removed.
    pub fn create(
        data_dir: &Path,
        name: &str,
        policy: RetentionPolicy,
        sync_writes: bool,
    ) -> Result<Self> {
        let path = data_dir.join(name);
        fs::create_dir(&path).map_err(|e| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        })?;

        match Self::create_files(&path, name, policy, sync_writes) {
            Ok(metric) => Ok(metric),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&path) {
                    tracing::warn!(
                        "failed to clean up partial metric '{}': {cleanup}",
                        path.display()
                    );
                }
                Err(e)
            }
        }
    }

    fn create_files(
        path: &Path,
        name: &str,
        policy: RetentionPolicy,
        sync_writes: bool,
    ) -> Result<Self> {
        let tiers = policy
    /// Opens a metric from its directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptedMetadata`] if meta.json is missing,
    /// unreadable or inconsistent with the directory name, and slab errors
    /// if a tier file is missing or does not match the policy.
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self> {
        let metadata_path = path.join(METADATA_FILE);
        let corrupted = |reason: String| StoreError::CorruptedMetadata {
            path: metadata_path.display().to_string(),
            reason,
        };

        let metadata_json =
            fs::read_to_string(&metadata_path).map_err(|e| corrupted(e.to_string()))?;
        let metadata: MetricMetadata =
            serde_json::from_str(&metadata_json).map_err(|e| corrupted(e.to_string()))?;

        if metadata.version != METADATA_VERSION {
            return Err(corrupted(format!(
                "unsupported metadata version: expected {}, found {}",
                METADATA_VERSION, metadata.version
            ))
            .into());
        }

        let dir_name = path.file_name().map(|n| n.to_string_lossy().to_string());
        if dir_name.as_deref() != Some(metadata.name.as_str()) {
            return Err(corrupted(format!(
                "metric name '{}' does not match its directory",
                metadata.name
            ))
            .into());
        }

        let tiers = metadata
            .policy
            .tiers()
            .iter()
            .enumerate()
            .map(|(i, tier)| TierArchive::open(tier_path(path, i), *tier))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: metadata.name,
            policy: metadata.policy,
            path: path.to_path_buf(),
            tiers,
            sync_writes,
        })
    }

    /// Returns `true` if `path` holds a committed metric.
    pub fn exists(path: &Path) -> bool {
        path.join(METADATA_FILE).is_file()
    }

    /// Returns `true` if `path` looks like the remains of an interrupted
    /// create or drop: a directory named like a metric that holds nothing
    /// but tier files and an uncommitted meta.json.
    pub fn is_leftover(path: &Path) -> bool {
        let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if normalize_name(dir_name).ok().as_deref() != Some(dir_name) {
            return false;
        }

        fs::read_dir(path).is_ok_and(|mut entries| {
            entries.all(|entry| {
                entry.is_ok_and(|entry| {
                    let is_file = entry.file_type().is_ok_and(|t| t.is_file());
                    let file_name = entry.file_name();
                    is_file
                        && file_name
                            .to_str()
                            .is_some_and(|n| n == METADATA_TMP_FILE || is_tier_file(n))
                })
            })
        })
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The retention policy.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// The metric directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archives from finest to coarsest.
    pub fn tiers(&self) -> &[TierArchive] {
        &self.tiers
    }

    /// Applies a sample to every tier.
    ///
    /// Each tier aggregates raw samples on its own; coarser tiers are not
    /// derived from finer ones.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::NonFiniteValue`] for NaN or infinite values
    /// (nothing is written), or a slab error if a slot cannot be written or
    /// synced.
    pub fn update(&mut self, timestamp: u64, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(ParseError::NonFiniteValue { value }.into());
        }

        for tier in &mut self.tiers {
            let index = tier.apply(timestamp, value)?;
            if self.sync_writes {
                tier.sync_slot(index)?;
            }
        }

        if let Some(finest) = self.tiers.first_mut() {
            finest.set_last_update(timestamp, value);
        }
        Ok(())
    }

    /// Runs a range query; see [`crate::query`].
    ///
    /// # Errors
    ///
    /// Returns a slab error if a slot cannot be read.
    pub fn select(&self, start: u64, end: u64, group_by: Option<Duration>) -> Result<QueryResult> {
        query::select(&self.tiers, start, end, group_by)
    }

    /// The most recent sample, if any.
    pub fn last_update(&self) -> Option<LastUpdate> {
        self.tiers
            .first()
            .and_then(TierArchive::last_update)
            .map(|(timestamp, value)| LastUpdate { timestamp, value })
    }

    /// Flushes every tier to disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SlabIoError::SyncFailed`] on the first failure.
    pub fn flush(&self) -> Result<()> {
        for tier in &self.tiers {
            tier.sync()?;
        }
        Ok(())
    }

    /// Deletes the metric's files.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryAccess`] if the files cannot be removed.
    pub fn destroy(self) -> Result<()> {
        let path = self.path.clone();
        // Unmap before deleting.
        drop(self);

        let metadata_path = path.join(METADATA_FILE);
        fs::remove_file(&metadata_path).map_err(|e| StoreError::DirectoryAccess {
            path: metadata_path.display().to_string(),
            source: e,
        })?;
        fs::remove_dir_all(&path).map_err(|e| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

fn tier_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("tier_{index}.slab"))
}

fn is_tier_file(file_name: &str) -> bool {
    file_name
        .strip_prefix("tier_")
        .and_then(|rest| rest.strip_suffix(".slab"))
        .is_some_and(|index| index.parse::<usize>().is_ok())
}

/// Writes meta.json atomically: temp file, fsync, rename.
fn write_metadata(dir: &Path, metadata: &MetricMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata).map_err(StoreError::MetadataSerialize)?;
    let final_path = dir.join(METADATA_FILE);
    let tmp_path = dir.join(METADATA_TMP_FILE);
    let write_failed = |source| StoreError::MetadataWrite {
        path: tmp_path.display().to_string(),
        source,
    };

    let mut file = fs::File::create(&tmp_path).map_err(write_failed)?;
    file.write_all(json.as_bytes()).map_err(write_failed)?;
    file.sync_all().map_err(write_failed)?;
    drop(file);

    fs::rename(&tmp_path, &final_path).map_err(|e| StoreError::MetadataWrite {
        path: final_path.display().to_string(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn policy(text: &str) -> RetentionPolicy {
        RetentionPolicy::parse(text).unwrap()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Test.Metric_1-a ").unwrap(), "test.metric_1-a");
        assert_eq!(normalize_name("42").unwrap(), "42");

        for bad in ["", "   ", ".hidden", "..", "-x", "a b", "a/b", "naïve", "a;b"] {
            let err = normalize_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse, "{bad:?}");
        }
        assert!(normalize_name(&"a".repeat(256)).is_err());
        assert!(normalize_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_create_writes_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let metric = Metric::create(
            temp_dir.path(),
            "cpu",
            policy("1 sec for 1 min, 1 min for 1 hour"),
            false,
        )
        .unwrap();

        let dir = temp_dir.path().join("cpu");
        assert_eq!(metric.path(), dir);
        assert!(dir.join("meta.json").is_file());
        assert!(dir.join("tier_0.slab").is_file());
        assert!(dir.join("tier_1.slab").is_file());
        assert!(!dir.join("meta.json.tmp").exists());
        assert!(Metric::exists(&dir));

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta["name"], "cpu");
        assert_eq!(meta["policy"], "1 sec for 1 min, 1 min for 1 hour");
        assert_eq!(meta["version"], 1);
    }

    #[test]
    fn test_update_and_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let p = policy("1 sec for 1 min, 10 secs for 1 hour");

        let before = {
            let mut metric = Metric::create(temp_dir.path(), "m", p.clone(), true).unwrap();
            for i in 0..25 {
                metric.update(1000 + i, f64::from(u32::try_from(i).unwrap())).unwrap();
            }
            assert_eq!(
                metric.last_update(),
                Some(LastUpdate {
                    timestamp: 1024,
                    value: 24.0
                })
            );
            metric.select(0, 2000, Duration::parse("10 secs").ok()).unwrap()
        };

        let metric = Metric::open(&temp_dir.path().join("m"), false).unwrap();
        assert_eq!(metric.policy(), &p);
        let after = metric.select(0, 2000, Duration::parse("10 secs").ok()).unwrap();
        assert_eq!(before, after);
        assert_eq!(after.rows().len(), 3);
        assert_eq!(metric.last_update().unwrap().timestamp, 1024);
    }

    #[test]
    fn test_rejects_non_finite_values() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut metric =
            Metric::create(temp_dir.path(), "m", policy("1 sec for 1 min"), false).unwrap();

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = metric.update(100, value).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse);
        }
        assert!(metric.select(0, 1000, None).unwrap().is_empty());
        assert_eq!(metric.last_update(), None);
    }

    #[test]
    fn test_tiers_aggregate_independently() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut metric = Metric::create(
            temp_dir.path(),
            "m",
            policy("1 sec for 5 secs, 10 secs for 1 min"),
            false,
        )
        .unwrap();

        metric.update(1005, 2.0).unwrap();
        // Arrives late and aliases 1005's fine slot (5 slots), replacing it.
        metric.update(1000, 4.0).unwrap();

        let fine = metric.select(0, 2000, None).unwrap();
        assert_eq!(fine.rows().len(), 1);
        assert_eq!(fine.rows()[0].bucket_start, 1000);
        assert_eq!(fine.rows()[0].sum, 4.0);

        // The coarse tier saw both raw samples.
        let coarse = metric.select(0, 2000, Duration::parse("10 secs").ok()).unwrap();
        assert_eq!(coarse.rows().len(), 1);
        assert_eq!(coarse.rows()[0].count, 2);
        assert_eq!(coarse.rows()[0].sum, 6.0);
    }

    #[test]
    fn test_open_rejects_bad_metadata() {
        let temp_dir = tempfile::tempdir().unwrap();
        drop(Metric::create(temp_dir.path(), "m", policy("1 sec for 1 min"), false).unwrap());
        let dir = temp_dir.path().join("m");

        fs::write(dir.join("meta.json"), "{ invalid json }").unwrap();
        let err = Metric::open(&dir, false).unwrap_err();
        assert!(err.to_string().contains("corrupted metadata"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_open_rejects_missing_tier() {
        let temp_dir = tempfile::tempdir().unwrap();
        drop(
            Metric::create(temp_dir.path(), "m", policy("1 sec for 1 min, 1 min for 1 hour"), false)
                .unwrap(),
        );
        let dir = temp_dir.path().join("m");
        fs::remove_file(dir.join("tier_1.slab")).unwrap();

        assert!(Metric::open(&dir, false).is_err());
    }

    #[test]
    fn test_create_refuses_existing_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("m");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("tier_0.slab"), b"in use").unwrap();

        let err =
            Metric::create(temp_dir.path(), "m", policy("1 sec for 1 min"), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        // Nothing that was already there is touched.
        assert_eq!(fs::read(dir.join("tier_0.slab")).unwrap(), b"in use");
    }

    #[test]
    fn test_is_leftover() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        let half = root.join("half");
        fs::create_dir(&half).unwrap();
        fs::write(half.join("tier_0.slab"), b"").unwrap();
        fs::write(half.join("tier_12.slab"), b"").unwrap();
        fs::write(half.join("meta.json.tmp"), b"{").unwrap();
        assert!(Metric::is_leftover(&half));

        let empty = root.join("empty");
        fs::create_dir(&empty).unwrap();
        assert!(Metric::is_leftover(&empty));

        let photos = root.join("photos");
        fs::create_dir(&photos).unwrap();
        fs::write(photos.join("holiday.jpg"), b"jpeg").unwrap();
        assert!(!Metric::is_leftover(&photos));

        let bad_name = root.join("My Stuff");
        fs::create_dir(&bad_name).unwrap();
        fs::write(bad_name.join("tier_0.slab"), b"").unwrap();
        assert!(!Metric::is_leftover(&bad_name));

        let nested = root.join("nested");
        fs::create_dir_all(nested.join("tier_0.slab")).unwrap();
        assert!(!Metric::is_leftover(&nested));

        assert!(!Metric::is_leftover(&root.join("missing")));
    }

    #[test]
    fn test_destroy_removes_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let metric =
            Metric::create(temp_dir.path(), "m", policy("1 sec for 1 min"), false).unwrap();
        metric.destroy().unwrap();
        assert!(!temp_dir.path().join("m").exists());
    }
}

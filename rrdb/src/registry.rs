//! Process-wide registry of metrics.
//!
//! The registry owns the data directory. Each metric sits behind its own
//! mutex, so updates and queries against different metrics never contend;
//! the map lock is only held to look up, insert or remove an entry.
//!
//! An entry's slot is empty while its metric is being created or dropped.
//! The entry stays in the map for the whole operation, holding the slot's
//! mutex, so the name cannot be reused before the files on disk settle.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::duration::Duration;
use crate::error::{ErrorKind, MetricError, Result, StoreError};
use crate::metric::{LastUpdate, Metric, normalize_name};
use crate::policy::RetentionPolicy;
use crate::query::QueryResult;

/// Text of [`RetentionPolicy::default`].
pub const DEFAULT_POLICY: &str = "1 min for 1 day";

/// A metric slot in the registry; `None` while the metric is created or
/// dropped.
type MetricHandle = Arc<Mutex<Option<Metric>>>;

/// Options controlling registry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    /// Flush every touched slot before an update returns.
    pub sync_writes: bool,
    /// Policy for metrics created by an update of an unknown name.
    /// `None` makes such updates fail with [`MetricError::UnknownMetric`].
    pub default_policy: Option<RetentionPolicy>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            sync_writes: false,
            default_policy: Some(RetentionPolicy::default()),
        }
    }
}

/// Summary of one metric, as returned by `SHOW METRIC`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricInfo {
    /// Metric name.
    pub name: String,
    /// Retention policy.
    pub policy: RetentionPolicy,
    /// Most recent sample, if any.
    pub last_update: Option<LastUpdate>,
}

/// Process-wide map from metric name to metric.
#[derive(Debug)]
pub struct Registry {
    /// Data directory; one sub-directory per metric.
    path: PathBuf,
    /// Registry options.
    options: RegistryOptions,
    /// Metrics by normalized name.
    metrics: RwLock<BTreeMap<String, MetricHandle>>,
}

impl Registry {
    /// Opens the data directory, creating it if needed, and loads every
    /// persisted metric.
    ///
    /// Sub-directories without a committed meta.json that hold only tier
    /// files are leftovers of an interrupted create or drop and are
    /// removed. Any other directory is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryAccess`] if the directory cannot be
    /// created or listed, and the error of [`Metric::open`] for the first
    /// metric that fails to load.
    pub fn open<P: AsRef<Path>>(path: P, options: RegistryOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dir_error = |source| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&path).map_err(dir_error)?;

        let mut metrics = BTreeMap::new();
        for entry in fs::read_dir(&path).map_err(dir_error)? {
            let entry_path = entry.map_err(dir_error)?.path();
            if !entry_path.is_dir() {
                continue;
            }

            if !Metric::exists(&entry_path) {
                if Metric::is_leftover(&entry_path) {
                    tracing::warn!(
                        "removing incomplete metric directory '{}'",
                        entry_path.display()
                    );
                    if let Err(e) = fs::remove_dir_all(&entry_path) {
                        tracing::error!("failed to remove '{}': {e}", entry_path.display());
                    }
                } else {
                    tracing::warn!("skipping '{}': not a metric directory", entry_path.display());
                }
                continue;
            }

            let metric = Metric::open(&entry_path, options.sync_writes)?;
            tracing::debug!(
                "loaded metric '{}' with policy '{}'",
                metric.name(),
                metric.policy()
            );
            metrics.insert(metric.name().to_string(), Arc::new(Mutex::new(Some(metric))));
        }

        tracing::info!(
            "opened registry at '{}' with {} metrics",
            path.display(),
            metrics.len()
        );

        Ok(Self {
            path,
            options,
            metrics: RwLock::new(metrics),
        })
    }

    /// The data directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The registry options.
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Number of metrics, counting ones still being created.
    pub fn len(&self) -> usize {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if there are no metrics.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::AlreadyExists`] if the name is taken, a parse
    /// or policy error for bad input, or an I/O error if the files cannot
    /// be written.
    pub fn create(&self, name: &str, policy_text: &str) -> Result<()> {
        let name = normalize_name(name)?;
        if self.contains(&name) {
            return Err(MetricError::AlreadyExists { name }.into());
        }
        let policy = RetentionPolicy::parse(policy_text)?;
        self.create_with_policy(name, policy)
    }

    fn create_with_policy(&self, name: String, policy: RetentionPolicy) -> Result<()> {
        // Reserve the name with a locked, empty slot; the files are written
        // after the map lock is released.
        let handle: MetricHandle = Arc::new(Mutex::new(None));
        let mut slot = lock(&handle);
        {
            let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
            if metrics.contains_key(&name) {
                return Err(MetricError::AlreadyExists { name }.into());
            }
            metrics.insert(name.clone(), Arc::clone(&handle));
        }

        match Metric::create(&self.path, &name, policy, self.options.sync_writes) {
            Ok(metric) => {
                tracing::info!("created metric '{}' with policy '{}'", name, metric.policy());
                *slot = Some(metric);
                Ok(())
            }
            Err(e) => {
                self.remove_entry(&name, &handle);
                Err(e)
            }
        }
    }

    /// Drops a metric and deletes its files.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::UnknownMetric`] if the name is not present,
    /// or an I/O error if the files cannot be removed.
    pub fn drop_metric(&self, name: &str) -> Result<()> {
        let name = normalize_name(name)?;
        let unknown = || MetricError::UnknownMetric { name: name.clone() };
        let handle = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
            .ok_or_else(unknown)?;

        let mut slot = lock(&handle);
        let metric = slot.take().ok_or_else(unknown)?;
        let destroyed = metric.destroy();
        self.remove_entry(&name, &handle);
        drop(slot);

        destroyed?;
        tracing::info!("dropped metric '{name}'");
        Ok(())
    }

    /// Names containing `like` as a substring (all names if `None`), sorted.
    pub fn show_metrics(&self, like: Option<&str>) -> Vec<String> {
        let like = like.map(str::to_ascii_lowercase);
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|name| like.as_deref().is_none_or(|pattern| name.contains(pattern)))
            .cloned()
            .collect()
    }

    /// Canonical policy text of a metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::UnknownMetric`] if the name is not present.
    pub fn show_policy(&self, name: &str) -> Result<String> {
        self.with_metric(name, |metric| Ok(metric.policy().to_string()))
    }

    /// Name, policy and last sample of a metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::UnknownMetric`] if the name is not present.
    pub fn show_metric(&self, name: &str) -> Result<MetricInfo> {
        self.with_metric(name, |metric| {
            Ok(MetricInfo {
                name: metric.name().to_string(),
                policy: metric.policy().clone(),
                last_update: metric.last_update(),
            })
        })
    }

    /// Applies a sample to a metric.
    ///
    /// An unknown metric is created with the default policy first, unless
    /// [`RegistryOptions::default_policy`] is `None`. An update racing a drop
    /// of the same metric may fail with [`MetricError::UnknownMetric`].
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::UnknownMetric`] if the metric does not exist
    /// and cannot be created, a parse error for a bad name or value, or an
    /// I/O error from the write.
    pub fn update(&self, name: &str, timestamp: u64, value: f64) -> Result<()> {
        match self.with_metric(name, |metric| metric.update(timestamp, value)) {
            Err(e) if e.kind() == ErrorKind::UnknownMetric => {
                let Some(policy) = self.options.default_policy.clone() else {
                    return Err(e);
                };
                let name = normalize_name(name)?;
                match self.create_with_policy(name.clone(), policy) {
                    Ok(()) => {}
                    // Created concurrently by another update.
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e),
                }
                self.with_metric(&name, |metric| metric.update(timestamp, value))
            }
            other => other,
        }
    }

    /// Runs a range query against a metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricError::UnknownMetric`] if the name is not present,
    /// or an I/O error from reading slots.
    pub fn select(
        &self,
        name: &str,
        start: u64,
        end: u64,
        group_by: Option<Duration>,
    ) -> Result<QueryResult> {
        self.with_metric(name, |metric| metric.select(start, end, group_by))
    }

    /// Flushes every metric to disk.
    ///
    /// All metrics are attempted; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure.
    pub fn flush(&self) -> Result<()> {
        let handles: Vec<MetricHandle> = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut first_error = None;
        for handle in handles {
            let guard = lock(&handle);
            let Some(metric) = guard.as_ref() else {
                continue;
            };
            if let Err(e) = metric.flush() {
                tracing::error!("failed to flush metric '{}': {e}", metric.name());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Removes `name` from the map if it still refers to `handle`.
    fn remove_entry(&self, name: &str, handle: &MetricHandle) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if metrics.get(name).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            metrics.remove(name);
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Runs `f` on a metric while holding its lock.
    fn with_metric<T>(&self, name: &str, f: impl FnOnce(&mut Metric) -> Result<T>) -> Result<T> {
        let name = normalize_name(name)?;
        let handle = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();

        let unknown = || MetricError::UnknownMetric { name: name.clone() };
        let handle = handle.ok_or_else(unknown)?;
        let mut guard = lock(&handle);
        // Empty if a create failed or a drop ran after the lookup.
        let metric = guard.as_mut().ok_or_else(unknown)?;
        f(metric)
    }
}

/// Locks a metric, recovering from poisoning.
///
/// Slot records are checksummed and written whole, so a panic while the lock
/// was held cannot leave a half-written aggregate behind.
fn lock(handle: &Mutex<Option<Metric>>) -> MutexGuard<'_, Option<Metric>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RegistryOptions {
        RegistryOptions::default()
    }

    #[test]
    fn test_create_and_show() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();
        assert!(registry.is_empty());

        registry.create("test2", "1 sec for 1 min").unwrap();
        registry.create("Test1", "1 sec for 10 sec, 10 secs for 30 secs").unwrap();
        registry.create("other", "1 min for 1 hour").unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.show_metrics(None), vec!["other", "test1", "test2"]);
        assert_eq!(registry.show_metrics(Some("TE")), vec!["test1", "test2"]);
        assert!(registry.show_metrics(Some("zzz")).is_empty());
        assert_eq!(
            registry.show_policy("TEST1").unwrap(),
            "1 sec for 10 secs, 10 secs for 30 secs"
        );
    }

    #[test]
    fn test_create_duplicate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();

        registry.create("m", "1 sec for 1 min").unwrap();
        let err = registry.create(" M ", "not a policy").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.to_string(), "The metric 'm' already exists");
    }

    #[test]
    fn test_create_invalid_policy_leaves_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();

        let err = registry.create("m", "10 secs for 1 min, 1 sec for 1 hour").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
        assert!(registry.is_empty());
        assert!(!temp_dir.path().join("m").exists());
    }

    #[test]
    fn test_unknown_metric() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();

        let err = registry.select("nope", 0, 10, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownMetric);
        assert_eq!(err.to_string(), "The metric 'nope' does not exist");

        assert_eq!(registry.show_policy("nope").unwrap_err().kind(), ErrorKind::UnknownMetric);
        assert_eq!(registry.show_metric("nope").unwrap_err().kind(), ErrorKind::UnknownMetric);
        assert_eq!(registry.drop_metric("nope").unwrap_err().kind(), ErrorKind::UnknownMetric);
    }

    #[test]
    fn test_drop_metric() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();

        registry.create("m", "1 sec for 1 min").unwrap();
        registry.update("m", 100, 1.0).unwrap();
        registry.drop_metric("m").unwrap();

        assert!(registry.is_empty());
        assert!(!temp_dir.path().join("m").exists());
        assert_eq!(
            registry.select("m", 0, 1000, None).unwrap_err().kind(),
            ErrorKind::UnknownMetric
        );

        // The name can be reused with a different policy.
        registry.create("m", "1 min for 1 day").unwrap();
        assert_eq!(registry.show_policy("m").unwrap(), "1 min for 1 day");
        assert!(registry.select("m", 0, 1000, None).unwrap().is_empty());
    }

    #[test]
    fn test_update_auto_creates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();

        registry.update("auto", 120, 3.0).unwrap();
        assert_eq!(registry.show_policy("auto").unwrap(), DEFAULT_POLICY);

        let info = registry.show_metric("auto").unwrap();
        assert_eq!(info.name, "auto");
        assert_eq!(
            info.last_update,
            Some(LastUpdate {
                timestamp: 120,
                value: 3.0
            })
        );
    }

    #[test]
    fn test_update_without_auto_create() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(
            temp_dir.path(),
            RegistryOptions {
                default_policy: None,
                ..RegistryOptions::default()
            },
        )
        .unwrap();

        let err = registry.update("missing", 120, 3.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownMetric);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reopen_loads_metrics() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::open(temp_dir.path(), options()).unwrap();
            registry.create("a", "1 sec for 1 min").unwrap();
            registry.create("b", "1 min for 1 hour").unwrap();
            registry.update("a", 100, 2.0).unwrap();
            registry.flush().unwrap();
        }

        let registry = Registry::open(temp_dir.path(), options()).unwrap();
        assert_eq!(registry.show_metrics(None), vec!["a", "b"]);
        assert_eq!(
            registry.select("a", 0, 1000, None).unwrap().to_csv(),
            "ts,count,sum,sum_sqr,min,max\n100,1,2,4,2,2\n"
        );
    }

    #[test]
    fn test_open_removes_leftovers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let leftover = temp_dir.path().join("half");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("tier_0.slab"), b"partial").unwrap();
        fs::write(leftover.join("meta.json.tmp"), b"{").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"not a metric").unwrap();

        let registry = Registry::open(temp_dir.path(), options()).unwrap();
        assert!(registry.is_empty());
        assert!(!leftover.exists());
        assert!(temp_dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_open_keeps_foreign_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let photos = temp_dir.path().join("photos");
        fs::create_dir_all(&photos).unwrap();
        fs::write(photos.join("holiday.jpg"), b"jpeg").unwrap();
        let odd_name = temp_dir.path().join("Backup Copy");
        fs::create_dir_all(&odd_name).unwrap();
        fs::write(odd_name.join("tier_0.slab"), b"").unwrap();

        let registry = Registry::open(temp_dir.path(), options()).unwrap();
        registry.create("cpu", "1 sec for 1 min").unwrap();
        assert_eq!(registry.show_metrics(None), vec!["cpu"]);
        drop(registry);

        assert_eq!(fs::read(photos.join("holiday.jpg")).unwrap(), b"jpeg");
        assert!(odd_name.join("tier_0.slab").exists());

        // Reopening still skips them and loads the metric.
        let registry = Registry::open(temp_dir.path(), options()).unwrap();
        assert_eq!(registry.show_metrics(None), vec!["cpu"]);
        assert!(photos.join("holiday.jpg").exists());
    }

    #[test]
    fn test_failed_create_releases_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(temp_dir.path(), options()).unwrap();
        // A plain file where the metric directory would go.
        fs::write(temp_dir.path().join("taken"), b"not ours").unwrap();

        let err = registry.create("taken", "1 sec for 1 min").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(registry.is_empty());
        assert_eq!(registry.show_policy("taken").unwrap_err().kind(), ErrorKind::UnknownMetric);
        assert_eq!(fs::read(temp_dir.path().join("taken")).unwrap(), b"not ours");

        fs::remove_file(temp_dir.path().join("taken")).unwrap();
        registry.create("taken", "1 sec for 1 min").unwrap();
        assert_eq!(registry.show_policy("taken").unwrap(), "1 sec for 1 min");
    }

    #[test]
    fn test_concurrent_drop_and_update() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(temp_dir.path(), options()).unwrap());

        for round in 0..20 {
            registry.update("x", 1000, 1.0).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(4));

            let dropper = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.drop_metric("x")
                })
            };
            let updaters: Vec<_> = (0..3)
                .map(|t| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        for i in 0..50 {
                            match registry.update("x", 1000 + i, f64::from(t)) {
                                Ok(()) => {}
                                Err(e) => assert_eq!(e.kind(), ErrorKind::UnknownMetric, "{e}"),
                            }
                        }
                    })
                })
                .collect();

            dropper.join().unwrap().unwrap();
            for updater in updaters {
                updater.join().unwrap();
            }

            // Memory and disk agree after every round.
            let dir = temp_dir.path().join("x");
            if registry.show_metrics(None).is_empty() {
                assert!(!dir.exists(), "round {round}");
            } else {
                assert!(Metric::exists(&dir), "round {round}");
                registry.select("x", 0, 10_000, None).unwrap();
            }
        }

        registry.flush().unwrap();
        drop(registry);
        let reopened = Registry::open(temp_dir.path(), options()).unwrap();
        assert!(reopened.len() <= 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(temp_dir.path(), options()).unwrap());
        registry.create("shared", "1 min for 1 hour").unwrap();

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.update("shared", 600 + (i % 60), 1.0).unwrap();
                        registry.update(&format!("own{t}"), 600, 1.0).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let result = registry.select("shared", 0, 10_000, None).unwrap();
        assert_eq!(result.rows().len(), 1);
        assert_eq!(result.rows()[0].count, 800);
        assert_eq!(result.rows()[0].sum, 800.0);
        assert_eq!(registry.len(), 9);
    }
}

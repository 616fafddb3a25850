//! Parallel model reload
//!
//! Parses skeleton definition files on a dedicated rayon pool sized to the
//! hardware. Files are dealt to workers greedily by size, largest first onto
//! the least loaded worker, so one big model never leaves the rest idle.
//!
//! A pool that cannot be built disables reload instead of taking the process
//! down.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::config::RenderConfig;
use crate::error::ReloadError;
use crate::model::{ModelStore, Skeleton, SkeletonDef};

/// Extension of skeleton definition files
pub const DEFINITION_EXTENSION: &str = "json";

/// One file to parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadJob {
    pub path: PathBuf,
    /// Estimated cost, the file size in bytes
    pub cost: u64,
}

/// Summary of a reload
#[derive(Debug, Default)]
pub struct ReloadReport {
    pub loaded: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub elapsed: Duration,
}

/// Deal jobs to `workers` buckets, heaviest first onto the lightest bucket
pub fn balance(mut jobs: Vec<ReloadJob>, workers: usize) -> Vec<Vec<ReloadJob>> {
    let workers = workers.max(1);
    jobs.sort_by(|a, b| b.cost.cmp(&a.cost));

    let mut buckets: Vec<Vec<ReloadJob>> = vec![Vec::new(); workers];
    let mut loads: BinaryHeap<Reverse<(u64, usize)>> =
        (0..workers).map(|worker| Reverse((0, worker))).collect();

    for job in jobs {
        if let Some(Reverse((load, worker))) = loads.pop() {
            let load = load + job.cost;
            buckets[worker].push(job);
            loads.push(Reverse((load, worker)));
        }
    }
    buckets.retain(|bucket| !bucket.is_empty());
    buckets
}

/// Collect definition files in a directory
pub fn discover(dir: &Path) -> Result<Vec<ReloadJob>, ReloadError> {
    let entries =
        fs::read_dir(dir).map_err(|e| ReloadError::Directory(format!("{}: {}", dir.display(), e)))?;

    let mut jobs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_definition = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case(DEFINITION_EXTENSION));
        if !is_definition {
            continue;
        }
        let cost = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        jobs.push(ReloadJob { path, cost });
    }
    Ok(jobs)
}

fn load_file(path: &Path, merge_threshold: f32) -> Result<Skeleton, String> {
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let def = SkeletonDef::from_json(&text).map_err(|e| e.to_string())?;
    def.build(merge_threshold).map_err(|e| e.to_string())
}

/// Worker pool for reloads
pub struct ReloadPool {
    pool: Option<ThreadPool>,
    threads: usize,
    merge_threshold: f32,
}

impl ReloadPool {
    /// Build the pool; on failure reload is disabled and the error logged
    pub fn new(config: &RenderConfig) -> Self {
        let threads = if config.reload_threads > 0 {
            config.reload_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };

        let pool = match ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("rigsync-reload-{}", index))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                let e = ReloadError::PoolUnavailable(e.to_string());
                error!(threads, error = %e, "Reload disabled; lower reload_threads and restart");
                None
            }
        };

        Self {
            pool,
            threads,
            merge_threshold: config.keyframe_merge_threshold,
        }
    }

    pub fn is_available(&self) -> bool {
        self.pool.is_some()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Parse every job. Returns the skeletons built and the failures.
    pub fn parse_all(
        &self,
        jobs: Vec<ReloadJob>,
    ) -> Result<(Vec<Skeleton>, Vec<(PathBuf, String)>), ReloadError> {
        let pool = self.pool.as_ref().ok_or(ReloadError::Disabled)?;
        let buckets = balance(jobs, self.threads);
        let threshold = self.merge_threshold;

        let results: Vec<(PathBuf, Result<Skeleton, String>)> = pool.install(|| {
            buckets
                .into_par_iter()
                .flat_map_iter(|bucket| {
                    bucket
                        .into_iter()
                        .map(move |job| {
                            let result = load_file(&job.path, threshold);
                            (job.path, result)
                        })
                })
                .collect()
        });

        let mut skeletons = Vec::new();
        let mut failed = Vec::new();
        for (path, result) in results {
            match result {
                Ok(skeleton) => {
                    debug!(model = %skeleton.name(), file = %path.display(), "Model parsed");
                    skeletons.push(skeleton);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Model rejected");
                    failed.push((path, e));
                }
            }
        }
        Ok((skeletons, failed))
    }

    /// Parse a directory and swap the store's contents
    pub fn reload(&self, dir: &Path, store: &ModelStore) -> Result<ReloadReport, ReloadError> {
        if !self.is_available() {
            return Err(ReloadError::Disabled);
        }
        let start = Instant::now();
        let jobs = discover(dir)?;
        let files = jobs.len();
        let (skeletons, failed) = self.parse_all(jobs)?;
        let loaded = store.replace_all(skeletons);

        let report = ReloadReport {
            loaded,
            failed,
            elapsed: start.elapsed(),
        };
        info!(
            files,
            loaded = report.loaded,
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Reload complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ReloadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadPool")
            .field("available", &self.is_available())
            .field("threads", &self.threads)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job(name: &str, cost: u64) -> ReloadJob {
        ReloadJob {
            path: PathBuf::from(name),
            cost,
        }
    }

    #[test]
    fn test_balance_is_greedy_by_cost() {
        let buckets = balance(
            vec![job("a", 10), job("b", 70), job("c", 20), job("d", 30), job("e", 40)],
            2,
        );
        assert_eq!(buckets.len(), 2);
        let loads: Vec<u64> = buckets
            .iter()
            .map(|bucket| bucket.iter().map(|job| job.cost).sum())
            .collect();
        // 70+20 / 40+30+10
        assert_eq!(loads.iter().sum::<u64>(), 170);
        assert!(loads.contains(&90));
        assert!(loads.contains(&80));
        assert_eq!(buckets[0][0].path, PathBuf::from("b"));
    }

    #[test]
    fn test_balance_edge_cases() {
        assert!(balance(Vec::new(), 4).is_empty());
        let buckets = balance(vec![job("a", 1), job("b", 1)], 0);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].len(), 2);
    }

    #[test]
    fn test_reload_directory() {
        let dir = std::env::temp_dir().join(format!("rigsync-reload-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("crate.json"),
            r#"{ "name": "crate", "bones": [ { "name": "lid" } ] }"#,
        )
        .unwrap();
        fs::write(
            dir.join("broken.json"),
            r#"{ "name": "broken", "bones": [ { "name": "a", "parent": "missing" } ] }"#,
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let config = RenderConfig {
            reload_threads: 2,
            ..RenderConfig::default()
        };
        let pool = ReloadPool::new(&config);
        assert!(pool.is_available());

        let store = ModelStore::new();
        let report = pool.reload(&dir, &store).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(store.get("crate").is_some());
        assert!(store.get("broken").is_none());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory() {
        let pool = ReloadPool::new(&RenderConfig::default());
        let result = pool.reload(Path::new("/nonexistent/rigsync"), &ModelStore::new());
        assert!(matches!(result, Err(ReloadError::Directory(_))));
    }
}

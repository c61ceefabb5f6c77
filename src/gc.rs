//! Periodic cache garbage collection.
//!
//! A thin sweeper over the artifact cache: files untouched (by access
//! time) for longer than the configured age are deleted, except those
//! matching the preserve globs. Failures are logged and never retried;
//! the cache is safe to wipe entirely, so nothing here needs to be
//! clever.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::glob::GlobSet;

/// Sweeper configuration.
#[derive(Clone)]
pub struct GcConfig {
    pub cache_dir: PathBuf,
    pub interval: Duration,
    pub max_age: Duration,
    pub preserve: GlobSet,
}

/// Run the sweeper forever on its interval.
pub fn spawn(config: GcConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't
        // spent sweeping.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep(&config).await {
                Ok(removed) if removed > 0 => {
                    log::info!("cache gc removed {removed} files");
                }
                Ok(_) => {}
                Err(err) => log::warn!("cache gc failed: {err}"),
            }
        }
    })
}

/// One sweep pass. Returns the number of files removed.
pub async fn sweep(config: &GcConfig) -> std::io::Result<usize> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || {
        let mut removed = 0;
        let now = SystemTime::now();
        let mut stack = vec![config.cache_dir.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    if dir != config.cache_dir {
                        log::warn!("cache gc cannot read {}: {err}", dir.display());
                    }
                    continue;
                }
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = relative_key(&config.cache_dir, &path);
                if config.preserve.matches(&rel) {
                    continue;
                }
                let accessed = meta.accessed().or_else(|_| meta.modified());
                let Ok(accessed) = accessed else {
                    continue;
                };
                let age = now.duration_since(accessed).unwrap_or_default();
                if age > config.max_age {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            log::warn!("cache gc cannot remove {}: {err}", path.display());
                        }
                    }
                }
            }
        }
        Ok(removed)
    })
    .await
    .unwrap_or(Ok(0))
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backdate(path: &Path, secs: u64) {
        let past = SystemTime::now() - Duration::from_secs(secs);
        let times = std::fs::FileTimes::new()
            .set_accessed(past)
            .set_modified(past);
        std::fs::File::options()
            .append(true)
            .open(path)
            .unwrap()
            .set_times(times)
            .unwrap();
    }

    fn config(dir: &Path, preserve: &[&str]) -> GcConfig {
        GcConfig {
            cache_dir: dir.to_path_buf(),
            interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(60),
            preserve: GlobSet::compile(preserve.iter().copied()).unwrap(),
        }
    }

    #[tokio::test]
    async fn removes_old_files_keeps_fresh() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("deep")).unwrap();
        let old = dir.path().join("deep/old.json");
        let fresh = dir.path().join("fresh.json");
        std::fs::write(&old, "x").unwrap();
        std::fs::write(&fresh, "y").unwrap();
        backdate(&old, 3600);

        let removed = sweep(&config(dir.path(), &[])).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn preserve_globs_are_untouchable() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("idb/acc")).unwrap();
        let kept = dir.path().join("idb/acc/state.json");
        std::fs::write(&kept, "x").unwrap();
        backdate(&kept, 3600);

        let removed = sweep(&config(dir.path(), &["idb/**/*"])).await.unwrap();
        assert_eq!(removed, 0);
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn missing_cache_root_is_harmless() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("nope");
        assert_eq!(sweep(&config(&gone, &[])).await.unwrap(), 0);
    }
}

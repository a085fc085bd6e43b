use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use hsm_mux_core::{KeyCache, cache::MASTER_BACKUP_FILE};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

/// Periodically writes the key cache to `dir`.
#[derive(Clone)]
pub struct BackupScheduler {
    cache: Arc<KeyCache>,
    dir: PathBuf,
    interval: Duration,
}

impl BackupScheduler {
    pub fn new(cache: Arc<KeyCache>, dir: PathBuf, interval: Duration) -> Self {
        Self {
            cache,
            dir,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick fires immediately; the cache was just loaded
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let scheduler = self.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || scheduler.run_once())
                .await
                .context("cache backup task join")
                .and_then(|res| res)
            {
                error!("cache backup failed: {err:#}");
                metrics::counter!("hsm_mux_cache_backup_failures_total").increment(1);
            }
        }
    }

    pub fn run_once(&self) -> anyhow::Result<()> {
        self.cache
            .backup(&self.dir)
            .with_context(|| format!("failed to back up cache into {:?}", self.dir))?;
        metrics::gauge!("hsm_mux_cache_backup_keys").set(self.cache.key_count() as f64);
        Ok(())
    }
}

/// Loads the last backup from `dir` when there is one; otherwise the cache
/// starts empty. Either way the cache is initialized afterwards.
pub fn restore_or_start_empty(cache: &KeyCache, dir: &std::path::Path) -> anyhow::Result<usize> {
    if !dir.join(MASTER_BACKUP_FILE).exists() {
        info!(dir = %dir.display(), "no cache backup found; starting empty");
        cache.mark_initialized();
        return Ok(0);
    }
    cache
        .restore(dir)
        .with_context(|| format!("failed to restore cache from {dir:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn backup_is_restored_into_a_fresh_cache() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(KeyCache::new(2));
        let master = cache
            .add_key(1, Uuid::new_v4(), 3, 0, None)
            .expect("add key");

        BackupScheduler::new(Arc::clone(&cache), dir.path().to_path_buf(), Duration::from_secs(60))
            .run_once()
            .expect("backup");

        let restored = KeyCache::new(2);
        assert_eq!(restore_or_start_empty(&restored, dir.path()).expect("restore"), 1);
        assert!(restored.is_initialized());
        assert_eq!(restored.locations_of(&master), cache.locations_of(&master));
    }

    #[test]
    fn missing_backup_starts_empty() {
        let dir = TempDir::new().expect("tempdir");
        let cache = KeyCache::new(1);
        assert_eq!(restore_or_start_empty(&cache, dir.path()).expect("restore"), 0);
        assert!(cache.is_initialized());
        assert_eq!(cache.key_count(), 0);
    }
}

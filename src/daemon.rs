use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tokio::time::sleep;
use tracing::info;

use crate::CollectArgs;
use crate::alerts::{AlertManager, LogSink};
use crate::collect::Collector;
use crate::config::Config;

/// Run the scheduler: one full collection cycle every `update_interval`
/// seconds until interrupted, or a single cycle with `--once`.
///
/// A cycle that overruns the interval is followed immediately by the next
/// one. Ctrl-C is honoured between cycles, so the in-flight merge always
/// completes before exit.
pub async fn execute(config: Config, args: &CollectArgs) -> Result<()> {
    fs::create_dir_all(&config.data_path)
        .with_context(|| format!("create data dir {}", config.data_path.display()))?;

    // one writer per data directory
    let _lock_guard = acquire_lock(&config.lock_path())?;

    let interval = args
        .interval_seconds
        .unwrap_or(config.update_interval_seconds);
    info!(
        "scheduler starting: data at {}, polling every {interval}s",
        config.data_path.display()
    );

    let alerts = AlertManager::new(
        config.alert_history_path(),
        config.alert_throttle_minutes,
        Box::new(LogSink),
    );
    let mut collector = Collector::new(config, alerts)?;

    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        info!("--- cycle {cycle} ---");
        collector.run_cycle().await;
        collector.check_freshness();

        if args.once {
            info!("single cycle complete");
            return Ok(());
        }

        info!("waiting {interval}s for next cycle");
        tokio::select! {
            _ = sleep(Duration::from_secs(interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
        }
    }
}

/// Take an exclusive advisory lock, refusing to start when another scheduler
/// instance already holds it. The handle keeps the lock for process lifetime.
fn acquire_lock(lock_path: &Path) -> Result<std::fs::File> {
    fs::create_dir_all(lock_path.parent().unwrap_or(Path::new("."))).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("open lock file {}", lock_path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!(
            "another instance holds {}; refusing to run two writers",
            lock_path.display()
        );
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_lock_attempt_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".aemo-ingest.lock");
        let _first = acquire_lock(&path).unwrap();
        assert!(acquire_lock(&path).is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".aemo-ingest.lock");
        {
            let _guard = acquire_lock(&path).unwrap();
        }
        assert!(acquire_lock(&path).is_ok());
    }
}

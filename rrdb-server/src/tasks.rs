//! Periodic background jobs: flushing the registry and recording status.

use std::sync::Arc;
use std::time::Duration;

use rrdb::metric::unix_now;
use rrdb::Engine;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Flushes the registry every `period` until `shutdown` flips.
pub async fn flush_periodically(
    engine: Arc<Engine>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_periodically("flush", period, shutdown, move || engine.flush()).await;
}

/// Records status counters into `self.*` metrics every `period` until
/// `shutdown` flips.
pub async fn record_status_periodically(
    engine: Arc<Engine>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_periodically("status update", period, shutdown, move || {
        engine.record_status(unix_now())
    })
    .await;
}

/// Runs `job` on the blocking pool once per `period`. The first run happens
/// one period after start.
async fn run_periodically<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) where
    F: Fn() -> rrdb::Result<()> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = Arc::clone(&job);
                match tokio::task::spawn_blocking(move || job()).await {
                    Ok(Ok(())) => tracing::trace!("periodic {name} done"),
                    Ok(Err(e)) => tracing::error!("periodic {name} failed: {e}"),
                    Err(e) => tracing::error!("periodic {name} panicked: {e}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rrdb::{Counter, RegistryOptions};

    #[tokio::test]
    async fn test_flush_runs_each_period() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap());
        engine.registry().update("m", 1000, 1.0).unwrap();
        let (shutdown, rx) = watch::channel(false);

        let task = tokio::spawn(flush_periodically(
            Arc::clone(&engine),
            Duration::from_millis(20),
            rx,
        ));
        for _ in 0..100 {
            if engine.status().get(Counter::Flushes) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send(true).unwrap();
        task.await.unwrap();

        assert!(engine.status().get(Counter::Flushes) >= 2);
        assert_eq!(engine.status().get(Counter::FlushErrors), 0);
    }

    #[tokio::test]
    async fn test_record_status_creates_self_metrics() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::open(temp_dir.path(), RegistryOptions::default()).unwrap());
        let (shutdown, rx) = watch::channel(false);

        let task = tokio::spawn(record_status_periodically(
            Arc::clone(&engine),
            Duration::from_millis(20),
            rx,
        ));
        for _ in 0..100 {
            if engine.registry().show_metrics(Some("self.")).len() >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send(true).unwrap();
        task.await.unwrap();

        let names = engine.registry().show_metrics(Some("self."));
        assert!(names.contains(&"self.uptime".to_string()), "{names:?}");
        assert!(names.contains(&"self.tcp.requests".to_string()), "{names:?}");
        assert!(names.contains(&"self.rrdb.metrics".to_string()), "{names:?}");
    }
}

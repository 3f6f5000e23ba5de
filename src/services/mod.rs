use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};

use crate::config::NetworksConfig;
use crate::error::{BigBrotrError, Result};
use crate::metrics;
use crate::models::{NetworkType, ServiceName};

pub mod finder;
pub mod monitor;
pub mod seeder;
pub mod synchronizer;
pub mod validator;

pub use finder::Finder;
pub use monitor::Monitor;
pub use seeder::Seeder;
pub use synchronizer::Synchronizer;
pub use validator::Validator;

/// Per-cycle totals reported by every service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl CycleStats {
    pub fn merge(&mut self, other: CycleStats) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// A pipeline service driven by [`run_service`].
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> ServiceName;

    /// One cycle of work. Per-relay failures are collected into the
    /// stats; an `Err` marks the whole cycle as failed.
    async fn run(&mut self) -> Result<CycleStats>;

    /// True for services that run one cycle and exit.
    fn one_shot(&self) -> bool {
        false
    }

    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Driver options for the periodic loop.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub interval: Duration,
    /// Run a single cycle and return.
    pub once: bool,
    /// Exit with an error after this many consecutive cycle failures.
    pub max_consecutive_failures: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            once: false,
            max_consecutive_failures: 5,
        }
    }
}

/// Drive a service on a fixed schedule until shutdown.
///
/// The next tick fires at `last_start + interval`; a cycle that overruns
/// its interval is followed immediately by the next one. A shutdown
/// signal cancels the in-flight cycle at its next await point and the
/// loop exits cleanly. After `max_consecutive_failures` failed cycles in
/// a row the driver returns an error.
pub async fn run_service(
    service: &mut dyn Service,
    options: &RunOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let name = service.name();
    service.on_start().await?;

    let once = options.once || service.one_shot();
    let mut consecutive_failures = 0u32;
    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }

        let started = Instant::now();
        let cycle = tokio::select! {
            result = service.run() => Some(result),
            _ = shutdown.changed() => None,
        };
        let elapsed = started.elapsed();
        metrics::observe_histogram("cycle_duration_seconds", elapsed.as_secs_f64());

        let Some(cycle) = cycle else {
            tracing::info!(target: "bigbrotr::services", "shutdown service={name}");
            break Ok(());
        };

        match cycle {
            Ok(stats) => {
                consecutive_failures = 0;
                metrics::inc_counter("cycles_succeeded", 1);
                tracing::info!(
                    target: "bigbrotr::services",
                    "cycle_finished service={name} duration_ms={} succeeded={} failed={} skipped={}",
                    elapsed.as_millis(),
                    stats.succeeded,
                    stats.failed,
                    stats.skipped
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                metrics::inc_counter("cycles_failed", 1);
                tracing::error!(
                    target: "bigbrotr::services",
                    "cycle_failed service={name} consecutive={consecutive_failures} error={e}"
                );
                if once {
                    break Err(e);
                }
                if consecutive_failures >= options.max_consecutive_failures {
                    break Err(BigBrotrError::Other(anyhow::anyhow!(
                        "{name}: {consecutive_failures} consecutive cycle failures"
                    )));
                }
            }
        }

        if once {
            break Ok(());
        }

        // Fixed schedule: next tick at last_start + interval. An overrun
        // cycle yields a zero sleep and the next tick fires immediately.
        let sleep_for = options.interval.saturating_sub(elapsed);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => {
                tracing::info!(target: "bigbrotr::services", "shutdown service={name}");
                break Ok(());
            }
        }
    };

    service.on_stop().await?;
    result
}

/// Per-network concurrency budgets.
///
/// One FIFO-fair semaphore per network; a task holds its network's
/// permit for the duration of a relay connection. Local and unknown
/// hosts share the clearnet budget.
#[derive(Debug, Clone)]
pub struct NetworkSemaphores {
    clearnet: Arc<Semaphore>,
    tor: Arc<Semaphore>,
    i2p: Arc<Semaphore>,
    loki: Arc<Semaphore>,
}

impl NetworkSemaphores {
    pub fn from_config(networks: &NetworksConfig) -> Self {
        Self {
            clearnet: Arc::new(Semaphore::new(networks.clearnet.max_tasks)),
            tor: Arc::new(Semaphore::new(networks.tor.max_tasks)),
            i2p: Arc::new(Semaphore::new(networks.i2p.max_tasks)),
            loki: Arc::new(Semaphore::new(networks.loki.max_tasks)),
        }
    }

    pub fn get(&self, network: NetworkType) -> Arc<Semaphore> {
        match network {
            NetworkType::Clearnet | NetworkType::Local | NetworkType::Unknown => {
                Arc::clone(&self.clearnet)
            }
            NetworkType::Tor => Arc::clone(&self.tor),
            NetworkType::I2p => Arc::clone(&self.i2p),
            NetworkType::Loki => Arc::clone(&self.loki),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeService {
        runs: Arc<AtomicU32>,
        fail_first: u32,
        one_shot: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FakeService {
        fn new() -> Self {
            Self {
                runs: Arc::new(AtomicU32::new(0)),
                fail_first: 0,
                one_shot: true,
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Service for FakeService {
        fn name(&self) -> ServiceName {
            ServiceName::Seeder
        }

        fn one_shot(&self) -> bool {
            self.one_shot
        }

        async fn run(&mut self) -> Result<CycleStats> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push("run");
            if n < self.fail_first {
                return Err(BigBrotrError::Other(anyhow::anyhow!("boom")));
            }
            Ok(CycleStats {
                succeeded: 1,
                ..CycleStats::default()
            })
        }

        async fn on_start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("start");
            Ok(())
        }

        async fn on_stop(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("stop");
            Ok(())
        }
    }

    fn options(once: bool) -> RunOptions {
        RunOptions {
            interval: Duration::from_millis(5),
            once,
            max_consecutive_failures: 3,
        }
    }

    #[tokio::test]
    async fn one_shot_runs_once_with_lifecycle() {
        let mut service = FakeService::new();
        let log = Arc::clone(&service.log);
        let (_tx, rx) = watch::channel(false);

        run_service(&mut service, &options(false), rx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["start", "run", "stop"]);
    }

    #[tokio::test]
    async fn periodic_service_repeats_until_shutdown() {
        let mut service = FakeService::new();
        service.one_shot = false;
        let runs = Arc::clone(&service.runs);
        let (tx, rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            run_service(&mut service, &options(false), rx).await
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        driver.await.unwrap().unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn exits_after_max_consecutive_failures() {
        let mut service = FakeService::new();
        service.one_shot = false;
        service.fail_first = u32::MAX;
        let runs = Arc::clone(&service.runs);
        let (_tx, rx) = watch::channel(false);

        let result = run_service(&mut service, &options(false), rx).await;
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_counter_resets_on_success() {
        let mut service = FakeService::new();
        service.one_shot = false;
        service.fail_first = 2; // two failures, then success
        let runs = Arc::clone(&service.runs);
        let (tx, rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            run_service(&mut service, &options(false), rx).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        driver.await.unwrap().unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn once_flag_overrides_periodic() {
        let mut service = FakeService::new();
        service.one_shot = false;
        let runs = Arc::clone(&service.runs);
        let (_tx, rx) = watch::channel(false);

        run_service(&mut service, &options(true), rx).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn semaphores_respect_budgets() {
        let mut networks = NetworksConfig::default();
        networks.tor.max_tasks = 1;
        let semaphores = NetworkSemaphores::from_config(&networks);

        let tor = semaphores.get(NetworkType::Tor);
        let first = tor.clone().acquire_owned().await.unwrap();
        assert!(tor.clone().try_acquire_owned().is_err());
        drop(first);
        assert!(tor.try_acquire_owned().is_ok());

        // Local shares the clearnet budget
        assert_eq!(
            semaphores.get(NetworkType::Local).available_permits(),
            semaphores.get(NetworkType::Clearnet).available_permits()
        );
    }
}

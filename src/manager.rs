use crate::error::Result;
use crate::output::OutputPublisher;
use crate::scraper::ScraperDriver;
use crate::store::Store;
use crate::tester::Harness;
use crate::types::Protocol;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const IDLE_MIN: Duration = Duration::from_secs(1);
const IDLE_MAX: Duration = Duration::from_secs(30);
const SATURATED_POLL: Duration = Duration::from_millis(500);
const STALE_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const PRUNE_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Live occupancy counters. Workers write, the status server reads.
pub struct Counters {
    active: AtomicUsize,
    tested: AtomicU64,
    discarded: AtomicU64,
    started_at: Instant,
}

impl Counters {
    fn new() -> Self {
        Counters {
            active: AtomicUsize::new(0),
            tested: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn tested(&self) -> u64 {
        self.tested.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

struct ActiveGuard(Arc<Counters>);

impl ActiveGuard {
    fn new(counters: Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(counters)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub protocol: Protocol,
    pub max_workers: usize,
    /// Endpoints are not re-tested more often than once per this window.
    pub scan_interval: Duration,
    pub refresh_interval: Duration,
    pub notice_interval: Duration,
    pub output_interval: Duration,
    pub stop_grace: Duration,
    pub ban_threshold: i64,
    /// TESTING claims untouched this long are considered abandoned.
    pub stale_grace: Duration,
    /// Old FAIL/BANNED rows are deleted after this window, when set.
    pub prune_after: Option<Duration>,
}

/// The scheduler core: owns the bounded worker pool, the periodic
/// background tickers and the shutdown broadcast. All mutable proxy state
/// lives in the store; the manager only moves claims through workers.
pub struct Manager {
    store: Arc<Store>,
    harness: Arc<dyn Harness>,
    driver: Option<Arc<ScraperDriver>>,
    publisher: Option<Arc<OutputPublisher>>,
    cfg: ManagerConfig,
    counters: Arc<Counters>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Manager {
    pub fn new(
        store: Arc<Store>,
        harness: Arc<dyn Harness>,
        driver: Option<Arc<ScraperDriver>>,
        publisher: Option<Arc<OutputPublisher>>,
        cfg: ManagerConfig,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(cfg.max_workers));
        Manager {
            store,
            harness,
            driver,
            publisher,
            cfg,
            counters: Arc::new(Counters::new()),
            semaphore,
            shutdown_tx,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn max_workers(&self) -> usize {
        self.cfg.max_workers
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until the shutdown broadcast fires or the store fails fatally.
    pub async fn run(&self) -> Result<()> {
        // Claims orphaned by a previous crash become schedulable again
        // before anything else happens.
        self.store.recover_stale(self.cfg.stale_grace).await?;

        let tickers = self.spawn_tickers();
        let result = self.schedule_loop().await;

        // Tickers must see the signal even when the loop died on its own.
        let _ = self.shutdown_tx.send(true);
        for handle in tickers {
            let _ = handle.await;
        }
        info!("manager stopped");
        result
    }

    fn spawn_tickers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(driver) = &self.driver {
            let driver = driver.clone();
            handles.push(self.spawn_ticker("refresh", self.cfg.refresh_interval, move || {
                let driver = driver.clone();
                async move { driver.run_once().await }
            }));
        }

        if let Some(publisher) = &self.publisher {
            let publisher = publisher.clone();
            handles.push(self.spawn_ticker("output", self.cfg.output_interval, move || {
                let publisher = publisher.clone();
                async move { publisher.run_once().await }
            }));
        }

        let store = self.store.clone();
        let counters = self.counters.clone();
        let max_workers = self.cfg.max_workers;
        handles.push(self.spawn_ticker("notice", self.cfg.notice_interval, move || {
            let store = store.clone();
            let counters = counters.clone();
            async move {
                match store.stats().await {
                    Ok(stats) => info!(
                        new = stats.new,
                        testing = stats.testing,
                        ok = stats.ok,
                        fail = stats.fail,
                        banned = stats.banned,
                        total = stats.total,
                        active = counters.active(),
                        max_workers,
                        tested = counters.tested(),
                        discarded = counters.discarded(),
                        "pool status"
                    ),
                    Err(e) => warn!(error = %e, "stats query failed"),
                }
            }
        }));

        let store = self.store.clone();
        let grace = self.cfg.stale_grace;
        handles.push(self.spawn_ticker("stale-claims", STALE_SWEEP_PERIOD, move || {
            let store = store.clone();
            async move {
                if let Err(e) = store.recover_stale(grace).await {
                    warn!(error = %e, "stale claim sweep failed");
                }
            }
        }));

        if let Some(prune_after) = self.cfg.prune_after {
            let store = self.store.clone();
            handles.push(self.spawn_ticker("prune", PRUNE_PERIOD, move || {
                let store = store.clone();
                async move {
                    match store.prune(prune_after).await {
                        Ok(0) => {}
                        Ok(pruned) => info!(pruned, "pruned old dead endpoints"),
                        Err(e) => warn!(error = %e, "prune failed"),
                    }
                }
            }));
        }

        handles
    }

    fn spawn_ticker<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        action: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let should_run = tokio::select! {
                    _ = tick.tick() => true,
                    _ = rx.wait_for(|stop| *stop) => false,
                };
                if !should_run {
                    break;
                }
                action().await;
            }
            debug!(ticker = name, "ticker stopped");
        })
    }

    async fn schedule_loop(&self) -> Result<()> {
        let mut rx = self.subscribe();
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut idle = IDLE_MIN;

        let outcome = loop {
            if *rx.borrow() {
                break Ok(());
            }
            while let Some(finished) = workers.try_join_next() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("worker panicked; claim left for the stale sweep");
                    }
                }
            }

            let free = self.semaphore.available_permits();
            if free == 0 {
                if wait_or_shutdown(&mut rx, SATURATED_POLL).await {
                    break Ok(());
                }
                continue;
            }

            let batch = match self
                .store
                .claim_batch(self.cfg.protocol, free, self.cfg.scan_interval)
                .await
            {
                Ok(batch) => batch,
                // The store already retried transient problems.
                Err(e) => break Err(e),
            };
            if batch.is_empty() {
                if wait_or_shutdown(&mut rx, idle).await {
                    break Ok(());
                }
                idle = (idle * 2).min(IDLE_MAX);
                continue;
            }
            idle = IDLE_MIN;
            debug!(claimed = batch.len(), "dispatching claims");

            for proxy in batch {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                };
                let store = self.store.clone();
                let harness = self.harness.clone();
                let counters = self.counters.clone();
                let ban_threshold = self.cfg.ban_threshold;
                workers.spawn(async move {
                    let _permit = permit;
                    let _guard = ActiveGuard::new(counters.clone());
                    let verdict = harness.run(&proxy.endpoint).await;
                    if verdict.cancelled {
                        counters.discarded.fetch_add(1, Ordering::Relaxed);
                        debug!(endpoint = %proxy.endpoint, "verdict discarded on cancellation");
                        return;
                    }
                    match store.release(proxy.id, &verdict, ban_threshold).await {
                        Ok(()) => {
                            counters.tested.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                endpoint = %proxy.endpoint,
                                outcome = ?verdict.outcome,
                                latency_ms = verdict.latency_ms,
                                "verdict released"
                            );
                        }
                        Err(e) => error!(
                            endpoint = %proxy.endpoint,
                            error = %e,
                            "release failed; claim left for the stale sweep"
                        ),
                    }
                });
            }
        };

        self.drain(workers).await;
        outcome
    }

    /// Give in-flight workers the grace period, then abandon the rest.
    /// Abandoned claims are recovered by the stale sweep on next startup.
    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }
        info!(
            in_flight = workers.len(),
            grace_secs = self.cfg.stop_grace.as_secs(),
            "waiting for in-flight tests"
        );
        let deadline = tokio::time::Instant::now() + self.cfg.stop_grace;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(abandoned = workers.len(), "grace period expired; abandoning workers");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    break;
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => error!("worker panicked during drain"),
                    Some(_) => {}
                }
            }
        }
    }
}

async fn wait_or_shutdown(rx: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = rx.wait_for(|stop| *stop) => true,
    }
}

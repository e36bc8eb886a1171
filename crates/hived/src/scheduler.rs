//! Periodic loop driver
//!
//! One `PeriodicTask` per loop. A cycle runs in its own task and is never
//! aborted: when it outlives its deadline the loop logs a skip and refuses
//! to start another cycle until it finishes, so mutations always complete.

use async_trait::async_trait;
use hive_common::error::HiveError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Body of a periodic loop
#[async_trait]
pub trait Cycle: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_cycle(&self) -> Result<(), HiveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub deadline: Duration,
    pub shutdown_grace: Duration,
}

/// Counters returned when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub completed: u64,
    pub failed: u64,
    pub deadline_skips: u64,
    pub overlap_skips: u64,
    /// Shutdown grace ran out with a cycle still running
    pub abandoned: bool,
}

pub struct PeriodicTask<C: Cycle> {
    cycle: Arc<C>,
    schedule: Schedule,
}

/// Resolves once shutdown is requested or the sender is gone
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl<C: Cycle> PeriodicTask<C> {
    pub fn new(cycle: Arc<C>, schedule: Schedule) -> Self {
        Self { cycle, schedule }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<LoopStats> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        let name = self.cycle.name();
        let mut stats = LoopStats::default();
        let mut ticker = tokio::time::interval(self.schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<JoinHandle<Result<(), HiveError>>> = None;

        info!(task = name, interval = ?self.schedule.interval, "loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            if let Some(handle) = &in_flight {
                if !handle.is_finished() {
                    stats.overlap_skips += 1;
                    warn!(task = name, "previous cycle still running, skipping tick");
                    continue;
                }
            }

            let cycle = self.cycle.clone();
            let mut handle = tokio::spawn(async move { cycle.run_cycle().await });

            let waited = tokio::select! {
                res = tokio::time::timeout(self.schedule.deadline, &mut handle) => Some(res),
                _ = shutdown_requested(&mut shutdown) => None,
            };

            match waited {
                Some(Ok(joined)) => {
                    in_flight = None;
                    match joined {
                        Ok(Ok(())) => {
                            stats.completed += 1;
                            debug!(task = name, "cycle complete");
                        }
                        Ok(Err(e)) => {
                            stats.failed += 1;
                            if e.is_operator_visible() {
                                error!(task = name, error = %e, "cycle failed, operator action needed");
                            } else {
                                warn!(task = name, error = %e, "cycle failed, retrying next tick");
                            }
                        }
                        Err(e) => {
                            stats.failed += 1;
                            error!(task = name, error = %e, "cycle panicked");
                        }
                    }
                }
                Some(Err(_elapsed)) => {
                    stats.deadline_skips += 1;
                    warn!(
                        task = name,
                        deadline = ?self.schedule.deadline,
                        "cycle exceeded deadline, left running"
                    );
                    in_flight = Some(handle);
                }
                None => {
                    in_flight = Some(handle);
                    break;
                }
            }
        }

        if let Some(handle) = in_flight.filter(|h| !h.is_finished()) {
            info!(task = name, grace = ?self.schedule.shutdown_grace, "waiting for in-flight cycle");
            if tokio::time::timeout(self.schedule.shutdown_grace, handle)
                .await
                .is_err()
            {
                stats.abandoned = true;
                error!(task = name, "shutdown grace expired with a cycle in flight");
            }
        }

        info!(task = name, completed = stats.completed, "loop stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct SleepyCycle {
        duration: Duration,
        runs: AtomicU32,
        finished: AtomicBool,
    }

    impl SleepyCycle {
        fn new(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                duration,
                runs: AtomicU32::new(0),
                finished: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Cycle for SleepyCycle {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn run_cycle(&self) -> Result<(), HiveError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn schedule(interval: u64, deadline: u64, grace: u64) -> Schedule {
        Schedule {
            interval: Duration::from_secs(interval),
            deadline: Duration::from_secs(deadline),
            shutdown_grace: Duration::from_secs(grace),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval() {
        let cycle = SleepyCycle::new(Duration::from_secs(1));
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new(cycle.clone(), schedule(10, 5, 5)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(35)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        // ticks at 0, 10, 20, 30
        assert_eq!(stats.completed, 4);
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 4);
        assert_eq!(stats.deadline_skips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_skip_without_overlap() {
        let cycle = SleepyCycle::new(Duration::from_secs(25));
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new(cycle.clone(), schedule(10, 5, 5)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(27)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.deadline_skips, 1);
        assert_eq!(stats.overlap_skips, 2);
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);
        assert!(cycle.finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_cycle() {
        let cycle = SleepyCycle::new(Duration::from_secs(8));
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new(cycle.clone(), schedule(60, 30, 20)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert!(cycle.finished.load(Ordering::SeqCst));
        assert!(!stats.abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_expires() {
        let cycle = SleepyCycle::new(Duration::from_secs(50));
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new(cycle.clone(), schedule(60, 30, 5)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert!(stats.abandoned);
        assert!(!cycle.finished.load(Ordering::SeqCst));
    }

    struct FailingCycle;

    #[async_trait]
    impl Cycle for FailingCycle {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run_cycle(&self) -> Result<(), HiveError> {
            Err(HiveError::TransientUnavailable("engine down".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let (tx, rx) = watch::channel(false);
        let task = PeriodicTask::new(Arc::new(FailingCycle), schedule(10, 5, 5)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.failed, 3);
        assert_eq!(stats.completed, 0);
    }
}

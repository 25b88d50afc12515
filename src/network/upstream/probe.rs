/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Coalescing background prober
//!
//! Runs a probe job periodically and on demand. At most one job runs at a
//! time per prober; a tick or trigger that lands while one is in flight is
//! dropped rather than queued.

use futures::future::BoxFuture;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace};

/// A probe job; each call produces one run
pub type ProbeJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ProbeState {
    in_flight: AtomicBool,
    runs: AtomicU64,
}

/// Clears the in-flight flag even if the job panics
struct InFlightGuard(Arc<ProbeState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

fn spawn_job(state: &Arc<ProbeState>, job: &ProbeJob) -> bool {
    if state
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }

    let guard = InFlightGuard(state.clone());
    let run = job();
    state.runs.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let _guard = guard;
        run.await;
    });
    true
}

pub struct Probe {
    state: Arc<ProbeState>,
    job: ProbeJob,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Probe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe")
            .field("in_flight", &self.in_flight())
            .field("runs", &self.runs())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Probe {
    pub fn new(job: ProbeJob) -> Self {
        Self {
            state: Arc::new(ProbeState::default()),
            job,
            ticker: Mutex::new(None),
        }
    }

    /// Run the job now unless a run is already in flight.
    /// Returns whether a run was started.
    pub fn trigger(&self) -> bool {
        let started = spawn_job(&self.state, &self.job);
        if !started {
            trace!("Probe already in flight, trigger dropped");
        }
        started
    }

    /// Start periodic runs every `interval`. No-op when already running or
    /// when `interval` is zero.
    pub fn start(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let state = self.state.clone();
        let job = self.job.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if !spawn_job(&state, &job) {
                    debug!("Previous probe still in flight, skipping tick");
                }
            }
        }));
    }

    /// Stop periodic runs; safe to call repeatedly or before `start`.
    /// A run already in flight finishes on its own.
    pub fn stop(&self) {
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn in_flight(&self) -> bool {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Number of runs started so far
    pub fn runs(&self) -> u64 {
        self.state.runs.load(Ordering::Relaxed)
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        if let Some(handle) = self
            .ticker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    fn counting_job(count: Arc<AtomicU64>, release: Arc<Notify>) -> ProbeJob {
        Arc::new(move || {
            let count = count.clone();
            let release = release.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
            })
        })
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce() {
        let count = Arc::new(AtomicU64::new(0));
        let release = Arc::new(Notify::new());
        let probe = Probe::new(counting_job(count.clone(), release.clone()));

        assert!(probe.trigger());
        assert!(!probe.trigger());
        assert!(!probe.trigger());
        assert!(probe.in_flight());
        assert_eq!(probe.runs(), 1);

        tokio::task::yield_now().await;
        release.notify_one();
        while probe.in_flight() {
            tokio::task::yield_now().await;
        }

        assert!(probe.trigger(), "a new run may start once the first ends");
        release.notify_one();
        assert_eq!(probe.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_follow_interval() {
        let count = Arc::new(AtomicU64::new(0));
        let job: ProbeJob = {
            let count = count.clone();
            Arc::new(move || {
                let count = count.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let probe = Probe::new(job);
        probe.start(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        probe.stop();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3, "no runs after stop");
    }

    #[tokio::test]
    async fn start_twice_stop_twice() {
        let job: ProbeJob = Arc::new(|| Box::pin(async {}));
        let probe = Probe::new(job);
        probe.stop();
        probe.start(Duration::from_secs(1));
        probe.start(Duration::from_secs(1));
        assert!(probe.is_running());
        probe.stop();
        probe.stop();
        assert!(!probe.is_running());
    }

    #[tokio::test]
    async fn zero_interval_never_starts() {
        let job: ProbeJob = Arc::new(|| Box::pin(async {}));
        let probe = Probe::new(job);
        probe.start(Duration::ZERO);
        assert!(!probe.is_running());
    }
}

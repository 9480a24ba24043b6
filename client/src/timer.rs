// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! One-shot timers backed by spawned tokio tasks.
//!
//! A timer holds at most one pending task. The slot is cleared before the
//! task body runs, so a task may re-arm the timer that fired it and
//! `is_running()` is false while it does its work.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

pub type TimerTask = BoxFuture<'static, ()>;

struct Pending {
    id: u64,
    fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

pub struct RetryTimer {
    name: &'static str,
    pending: Arc<Mutex<Option<Pending>>>,
    next_id: AtomicU64,
}

fn lock(slot: &Mutex<Option<Pending>>) -> MutexGuard<'_, Option<Pending>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RetryTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Arms the timer, replacing any pending task. Returns the fire time.
    pub fn start(&self, delay: Duration, task: TimerTask) -> DateTime<Utc> {
        let fires_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::clone(&self.pending);
        let name = self.name;

        let mut guard = lock(&self.pending);
        if let Some(previous) = guard.take() {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut current = lock(&slot);
                match current.as_ref() {
                    Some(p) if p.id == id => *current = None,
                    _ => return,
                }
            }
            trace!(timer = name, "timer fired");
            task.await;
        });
        *guard = Some(Pending { id, fires_at, handle });
        fires_at
    }

    pub fn stop(&self) {
        if let Some(pending) = lock(&self.pending).take() {
            trace!(timer = self.name, "timer stopped");
            pending.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.pending).is_some()
    }

    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.pending).as_ref().map(|p| p.fires_at)
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Exponentially distributed delay with mean `delay`, so the moment a
/// scheduled request leaves the client does not reveal when it was queued.
pub fn privacy_delay(delay: Duration) -> Duration {
    let mean = delay.as_secs_f64();
    if mean <= 0.0 {
        return delay;
    }
    let u: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let secs = (-mean * (1.0 - u).ln()).clamp(1.0, mean * 10.0);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_and_clears() {
        let timer = RetryTimer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        let fires_at = timer.start(Duration::from_secs(15), counting_task(&counter));
        assert!(fires_at > Utc::now());
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let timer = RetryTimer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        timer.start(Duration::from_secs(15), counting_task(&counter));
        timer.stop();
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_pending_task() {
        let timer = RetryTimer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        timer.start(Duration::from_secs(15), counting_task(&counter));
        timer.start(Duration::from_secs(20), counting_task(&counter));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_privacy_delay_bounds() {
        let mean = Duration::from_secs(3_600);
        for _ in 0..100 {
            let d = privacy_delay(mean);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= mean * 10);
        }
        assert_eq!(privacy_delay(Duration::ZERO), Duration::ZERO);
    }
}

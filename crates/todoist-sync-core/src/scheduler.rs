//! Periodic execution.
//!
//! A [`Scheduler`] runs a tick callback at a fixed period until its
//! [`CancelHandle`] is cancelled. The daemon provides a tokio interval
//! implementation; [`ManualScheduler`] fires ticks on demand for tests.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Work run on every tick. Each call returns the future for one tick.
pub type Tick = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub trait Scheduler: Send + Sync {
    fn schedule_every(&self, period: Duration, tick: Tick) -> CancelHandle;
}

/// Stops a scheduled task. Cancelling twice is a no-op.
pub struct CancelHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct ScheduledTick {
    period: Duration,
    tick: Tick,
    active: Arc<AtomicBool>,
}

/// Deterministic scheduler: nothing runs until [`fire`](Self::fire) is called.
#[derive(Default)]
pub struct ManualScheduler {
    scheduled: Mutex<Vec<ScheduledTick>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one tick of every active schedule, in registration order.
    pub async fn fire(&self) {
        let ticks: Vec<Tick> = self
            .scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .map(|s| Arc::clone(&s.tick))
            .collect();
        for tick in ticks {
            tick().await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .count()
    }

    /// Periods of the active schedules.
    pub fn periods(&self) -> Vec<Duration> {
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .map(|s| s.period)
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_every(&self, period: Duration, tick: Tick) -> CancelHandle {
        let active = Arc::new(AtomicBool::new(true));
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ScheduledTick {
                period,
                tick,
                active: Arc::clone(&active),
            });
        CancelHandle::new(move || active.store(false, Ordering::SeqCst))
    }
}

//! Battle countdown reconciled against a shared time source.
//!
//! Remaining time is always derived from elapsed time since the round start,
//! never from a decremented counter, so a suspended process picks up the
//! correct value on its next tick.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Shared (server-synchronized) wall clock.
pub trait TimeSource: Send + Sync {
    /// Current time in epoch milliseconds, or `None` while unavailable.
    fn now_ms(&self) -> Option<i64>;
}

/// Local wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> Option<i64> {
        Some(chrono::Utc::now().timestamp_millis())
    }
}

/// Local wall clock corrected by the offset reported by the server.
///
/// Unavailable until the host calls [`NetworkTimeSource::sync`].
#[derive(Debug, Default)]
pub struct NetworkTimeSource {
    offset_ms: AtomicI64,
    synced: AtomicBool,
}

impl NetworkTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server timestamp observed now.
    pub fn sync(&self, server_now_ms: i64) {
        let local = chrono::Utc::now().timestamp_millis();
        self.offset_ms.store(server_now_ms - local, Ordering::SeqCst);
        self.synced.store(true, Ordering::SeqCst);
        tracing::debug!("network time synced, offset={}ms", server_now_ms - local);
    }

    pub fn invalidate(&self) {
        self.synced.store(false, Ordering::SeqCst);
    }
}

impl TimeSource for NetworkTimeSource {
    fn now_ms(&self) -> Option<i64> {
        if !self.synced.load(Ordering::SeqCst) {
            return None;
        }
        Some(chrono::Utc::now().timestamp_millis() + self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Time source driven explicitly by its owner, for tests and hosts that
/// replay recorded sessions.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: Mutex<Option<i64>>,
}

impl ManualTimeSource {
    pub fn new(now_ms: Option<i64>) -> Self {
        Self {
            now_ms: Mutex::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: Option<i64>) {
        if let Ok(mut guard) = self.now_ms.lock() {
            *guard = now_ms;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now_ms.lock() {
            if let Some(now) = guard.as_mut() {
                *now += by.as_millis() as i64;
            }
        }
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> Option<i64> {
        self.now_ms.lock().ok().and_then(|guard| *guard)
    }
}

/// Timing of one battle round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTiming {
    /// Round start on the shared clock, epoch ms.
    pub start_time_ms: i64,
    pub duration_secs: u32,
    /// Local monotonic instant matching `start_time_ms`.
    pub anchor: Instant,
}

/// Periodic countdown task. Dropping it aborts the task.
#[derive(Debug)]
pub struct Countdown {
    handle: JoinHandle<()>,
}

impl Countdown {
    pub fn cancel(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
pub struct SessionClock {
    source: Arc<dyn TimeSource>,
}

impl SessionClock {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self { source }
    }

    /// Build the timing of a round that started at `start_time_ms`.
    ///
    /// The monotonic anchor is back-dated by the time already elapsed on the
    /// shared clock, so a round joined late keeps its real deadline even if
    /// the shared clock disappears afterwards.
    pub fn timing(&self, start_time_ms: i64, duration_secs: u32) -> RoundTiming {
        let now = Instant::now();
        let already = self
            .source
            .now_ms()
            .map(|shared| Duration::from_millis((shared - start_time_ms).max(0) as u64))
            .unwrap_or_default();
        RoundTiming {
            start_time_ms,
            duration_secs,
            anchor: now.checked_sub(already).unwrap_or(now),
        }
    }

    pub fn elapsed(&self, timing: &RoundTiming) -> Duration {
        match self.source.now_ms() {
            Some(shared) => Duration::from_millis((shared - timing.start_time_ms).max(0) as u64),
            None => timing.anchor.elapsed(),
        }
    }

    pub fn remaining_seconds(&self, timing: &RoundTiming) -> u32 {
        let elapsed = self.elapsed(timing).as_secs();
        u64::from(timing.duration_secs).saturating_sub(elapsed) as u32
    }

    /// Tick every `period` with the recomputed remaining seconds.
    ///
    /// The first tick fires immediately. The task stops after reporting 0 or
    /// once `on_tick` returns false.
    pub fn spawn_countdown<F>(&self, timing: RoundTiming, period: Duration, on_tick: F) -> Countdown
    where
        F: Fn(u32) -> bool + Send + 'static,
    {
        let clock = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let remaining = clock.remaining_seconds(&timing);
                if !on_tick(remaining) || remaining == 0 {
                    break;
                }
            }
        });
        Countdown { handle }
    }
}

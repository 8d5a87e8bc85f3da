//! Barge-in monitor state and the interruption predicate.
//!
//! The monitor is shared by all three controllers:
//!
//! - `PlaybackController` arms it while a session is `Playing`, disarms it
//!   on every exit and stamps the end of naturally finished playback;
//! - `InteractionCoordinator` stamps every `Finished` event;
//! - `ListeningController` refuses to open the microphone while inside the
//!   debounce window.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::audio::recorder::EnergyLevel;

#[derive(Debug)]
pub struct BargeInMonitor {
    armed: AtomicBool,
    last_playback_end: Mutex<Option<Instant>>,
    debounce_window: Duration,
}

impl BargeInMonitor {
    pub fn new(debounce_window: Duration) -> Self {
        Self {
            armed: AtomicBool::new(false),
            last_playback_end: Mutex::new(None),
            debounce_window,
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn debounce_window(&self) -> Duration {
        self.debounce_window
    }

    pub fn record_playback_end(&self, at: Instant) {
        let mut last = self.last_playback_end.lock();
        // keep the latest stamp if two writers race
        if last.map_or(true, |prev| at > prev) {
            *last = Some(at);
        }
    }

    pub fn last_playback_end(&self) -> Option<Instant> {
        *self.last_playback_end.lock()
    }

    /// `true` while `now` is within the debounce window of the last end.
    pub fn in_debounce(&self, now: Instant) -> bool {
        self.remaining_debounce(now).is_some()
    }

    /// Time left in the debounce window, if any.
    pub fn remaining_debounce(&self, now: Instant) -> Option<Duration> {
        let end = (*self.last_playback_end.lock())?;
        let elapsed = now.saturating_duration_since(end);
        (elapsed < self.debounce_window).then(|| self.debounce_window - elapsed)
    }
}

/// Decides whether the user is talking over playback.
pub trait InterruptionPredicate: Send + Sync + 'static {
    fn should_interrupt(&self) -> bool;
}

/// Microphone energy above an absolute threshold, gated by the monitor.
pub struct EnergyInterruption {
    level: Arc<EnergyLevel>,
    monitor: Arc<BargeInMonitor>,
    threshold: f32,
    max_sample_age: Duration,
}

impl EnergyInterruption {
    pub fn new(
        level: Arc<EnergyLevel>,
        monitor: Arc<BargeInMonitor>,
        threshold: f32,
        max_sample_age: Duration,
    ) -> Self {
        Self {
            level,
            monitor,
            threshold,
            max_sample_age,
        }
    }
}

impl InterruptionPredicate for EnergyInterruption {
    fn should_interrupt(&self) -> bool {
        if !self.monitor.is_armed() || self.monitor.in_debounce(Instant::now()) {
            return false;
        }
        match self.level.latest(self.max_sample_age) {
            Some(rms) if rms > self.threshold => {
                debug!(rms, threshold = self.threshold, "barge-in energy detected");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicate(window: Duration) -> (EnergyInterruption, Arc<EnergyLevel>, Arc<BargeInMonitor>) {
        let level = Arc::new(EnergyLevel::new());
        let monitor = Arc::new(BargeInMonitor::new(window));
        let p = EnergyInterruption::new(
            Arc::clone(&level),
            Arc::clone(&monitor),
            0.04,
            Duration::from_secs(1),
        );
        (p, level, monitor)
    }

    #[test]
    fn debounce_window_is_half_open() {
        let monitor = BargeInMonitor::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(!monitor.in_debounce(t0));
        monitor.record_playback_end(t0);
        assert!(monitor.in_debounce(t0));
        assert!(monitor.in_debounce(t0 + Duration::from_millis(999)));
        assert!(!monitor.in_debounce(t0 + Duration::from_secs(1)));
        assert_eq!(
            monitor.remaining_debounce(t0 + Duration::from_millis(400)),
            Some(Duration::from_millis(600))
        );
    }

    #[test]
    fn older_stamp_does_not_rewind_the_window() {
        let monitor = BargeInMonitor::new(Duration::from_secs(1));
        let t0 = Instant::now();
        monitor.record_playback_end(t0 + Duration::from_millis(500));
        monitor.record_playback_end(t0);
        assert_eq!(
            monitor.last_playback_end(),
            Some(t0 + Duration::from_millis(500))
        );
    }

    #[test]
    fn disarmed_monitor_never_interrupts() {
        let (p, level, _monitor) = predicate(Duration::from_secs(1));
        level.publish(0.9);
        assert!(!p.should_interrupt());
    }

    #[test]
    fn loud_energy_inside_debounce_is_ignored() {
        let (p, level, monitor) = predicate(Duration::from_secs(10));
        monitor.arm();
        monitor.record_playback_end(Instant::now());
        level.publish(0.9);
        assert!(!p.should_interrupt());
    }

    #[test]
    fn loud_energy_outside_debounce_interrupts() {
        let (p, level, monitor) = predicate(Duration::from_millis(1));
        monitor.arm();
        monitor.record_playback_end(Instant::now() - Duration::from_millis(50));
        level.publish(0.02);
        assert!(!p.should_interrupt(), "quiet room must not interrupt");
        level.publish(0.3);
        assert!(p.should_interrupt());
    }
}

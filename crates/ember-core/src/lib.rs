// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::time::{Duration, Instant};

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
    tracing::debug!("tracing initialized (default filter = {default_filter})");
}

/// Counts rendered frames and reports once per window.
#[derive(Debug)]
pub struct FpsCounter {
    window: Duration,
    frames: u32,
    since: Instant,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self::with_window(now, Duration::from_secs(1))
    }

    pub fn with_window(now: Instant, window: Duration) -> Self {
        Self {
            window,
            frames: 0,
            since: now,
        }
    }

    pub fn frame(&mut self) {
        self.frames = self.frames.saturating_add(1);
    }

    /// Frames counted in the elapsed window, if it has elapsed. Restarts the window.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        if now.duration_since(self.since) < self.window {
            return None;
        }
        let frames = self.frames;
        self.frames = 0;
        self.since = now;
        Some(frames)
    }

    /// Drops the partial count, e.g. while the window is paused.
    pub fn reset(&mut self, now: Instant) {
        self.frames = 0;
        self.since = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_only_after_window_elapses() {
        let t0 = Instant::now();
        let mut fps = FpsCounter::new(t0);
        fps.frame();
        fps.frame();
        assert_eq!(fps.tick(t0 + Duration::from_millis(500)), None);
        fps.frame();
        assert_eq!(fps.tick(t0 + Duration::from_secs(1)), Some(3));
        // window restarted
        assert_eq!(fps.tick(t0 + Duration::from_millis(1500)), None);
        assert_eq!(fps.tick(t0 + Duration::from_secs(2)), Some(0));
    }

    #[test]
    fn reset_discards_partial_count() {
        let t0 = Instant::now();
        let mut fps = FpsCounter::with_window(t0, Duration::from_millis(100));
        fps.frame();
        fps.reset(t0 + Duration::from_millis(50));
        fps.frame();
        assert_eq!(fps.tick(t0 + Duration::from_millis(150)), Some(1));
    }
}

use crate::{facade::Player, sdk::PlayableRange, Result};

/// Buffered animation required before the clock starts moving.
pub const DEFAULT_START_THRESHOLD_MS: f64 = 20.0;

/// Anything that can present buffered animation at a requested time.
pub trait PlaybackSource {
    fn playable_range(&self) -> Result<PlayableRange>;
    /// Returns the time actually presented after clamping.
    fn update_animation(&self, time_ms: f64) -> Result<f64>;
}

impl PlaybackSource for Player {
    fn playable_range(&self) -> Result<PlayableRange> {
        Player::playable_range(self)
    }

    fn update_animation(&self, time_ms: f64) -> Result<f64> {
        Player::update_animation(self, time_ms)
    }
}

/// Presentation clock in milliseconds.
///
/// The clock holds at zero until the source has buffered at least the start
/// threshold, then advances with the presentation delta and adopts whatever
/// clamped time the source reports back, so it never runs ahead of the
/// buffered window.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    time_ms: f64,
    started: bool,
    start_threshold_ms: f64,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new(DEFAULT_START_THRESHOLD_MS)
    }
}

impl PlaybackClock {
    pub fn new(start_threshold_ms: f64) -> Self {
        Self {
            time_ms: 0.0,
            started: false,
            start_threshold_ms: start_threshold_ms.max(0.0),
        }
    }

    pub fn time_ms(&self) -> f64 {
        self.time_ms
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn reset(&mut self) {
        self.time_ms = 0.0;
        self.started = false;
    }

    /// Advances by `delta_seconds` and moves `source` to the new time.
    /// Returns whether playback has started.
    pub fn advance<S>(&mut self, delta_seconds: f32, source: &S) -> Result<bool>
    where
        S: PlaybackSource + ?Sized,
    {
        let range = source.playable_range()?;
        if self.started {
            if delta_seconds.is_finite() && delta_seconds > 0.0 {
                self.time_ms += f64::from(delta_seconds) * 1000.0;
            }
        } else if range.span_ms() >= self.start_threshold_ms {
            tracing::debug!(span_ms = range.span_ms(), "playback started");
            self.time_ms = 0.0;
            self.started = true;
        }

        if self.started {
            self.time_ms = source.update_animation(self.time_ms)?;
        }
        Ok(self.started)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    struct FakeSource {
        range: Cell<PlayableRange>,
        requests: RefCell<Vec<f64>>,
    }

    impl FakeSource {
        fn new(min_ms: f64, max_ms: f64) -> Self {
            Self {
                range: Cell::new(PlayableRange { min_ms, max_ms }),
                requests: RefCell::new(Vec::new()),
            }
        }
    }

    impl PlaybackSource for FakeSource {
        fn playable_range(&self) -> Result<PlayableRange> {
            Ok(self.range.get())
        }

        fn update_animation(&self, time_ms: f64) -> Result<f64> {
            self.requests.borrow_mut().push(time_ms);
            Ok(self.range.get().clamp(time_ms))
        }
    }

    #[test]
    fn holds_until_the_threshold_is_buffered() {
        let source = FakeSource::new(0.0, 10.0);
        let mut clock = PlaybackClock::default();

        assert!(!clock.advance(0.016, &source).unwrap());
        assert!(source.requests.borrow().is_empty());
        assert_eq!(clock.time_ms(), 0.0);

        source.range.set(PlayableRange {
            min_ms: 0.0,
            max_ms: 20.0,
        });
        assert!(clock.advance(0.016, &source).unwrap());
        // the frame that starts playback presents time zero
        assert_eq!(source.requests.borrow().as_slice(), &[0.0]);
        assert_eq!(clock.time_ms(), 0.0);
    }

    #[test]
    fn adopts_the_clamped_time() {
        let source = FakeSource::new(0.0, 50.0);
        let mut clock = PlaybackClock::default();
        clock.advance(0.0, &source).unwrap();

        clock.advance(0.030, &source).unwrap();
        assert!((clock.time_ms() - 30.0).abs() < 1e-6);

        clock.advance(0.100, &source).unwrap();
        assert_eq!(clock.time_ms(), 50.0);

        source.range.set(PlayableRange {
            min_ms: 40.0,
            max_ms: 200.0,
        });
        clock.advance(0.010, &source).unwrap();
        assert!((clock.time_ms() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn reset_stops_playback() {
        let source = FakeSource::new(0.0, 100.0);
        let mut clock = PlaybackClock::new(20.0);
        clock.advance(0.05, &source).unwrap();
        assert!(clock.is_started());

        clock.reset();
        assert!(!clock.is_started());
        assert_eq!(clock.time_ms(), 0.0);
    }
}

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Produces the per-frame `dt` fed to the timer and script schedulers.
///
/// Call [`tick`](FrameClock::tick) once per frame. The returned delta is the
/// time since the previous tick in seconds, clamped to `max_dt` so a stall
/// (a suspended process, a debugger) does not replay as one huge frame.
pub struct FrameClock {
    last: Option<Instant>,
    max_dt: f64,
    frames: u64,
    elapsed: f64,
    ticks: VecDeque<Instant>,
    window: Duration,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(0.25)
    }
}

impl FrameClock {
    pub fn new(max_dt: f64) -> Self {
        Self {
            last: None,
            max_dt: max_dt.max(0.0),
            frames: 0,
            elapsed: 0.0,
            ticks: VecDeque::new(),
            window: Duration::from_secs(1),
        }
    }

    /// Record a frame at `now` and return its delta. The first frame is `0.0`.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let dt = match self.last {
            Some(last) => now.saturating_duration_since(last).as_secs_f64(),
            None => 0.0,
        };
        let dt = dt.min(self.max_dt);
        self.last = Some(now);
        self.frames += 1;
        self.elapsed += dt;

        self.ticks.push_back(now);
        let cutoff = now.checked_sub(self.window);
        while let (Some(&front), Some(cutoff)) = (self.ticks.front(), cutoff) {
            if front >= cutoff {
                break;
            }
            self.ticks.pop_front();
        }
        dt
    }

    /// Frames ticked so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Sum of every clamped delta, i.e. the time the schedulers have seen.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Frames per second over the last second. `0.0` until two frames exist.
    pub fn fps(&self) -> f64 {
        if self.ticks.len() < 2 {
            return 0.0;
        }
        self.ticks.len() as f64 / self.window.as_secs_f64()
    }
}

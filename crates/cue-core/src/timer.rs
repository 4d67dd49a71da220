use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use anyhow::Result;
use cue_config::TimerConfig;

/// What a repeating timer does when one `update` covers more than a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchUp {
    /// Fire at most once per `update`; the overshoot is carried forward by
    /// the wrap step so the long-run cadence does not drift.
    #[default]
    AtMostOnce,
    /// Fire once per elapsed period, up to the given number of times per
    /// `update`.
    Bounded(u32),
}

impl From<&TimerConfig> for CatchUp {
    fn from(config: &TimerConfig) -> Self {
        if config.catch_up {
            CatchUp::Bounded(config.max_catch_up)
        } else {
            CatchUp::AtMostOnce
        }
    }
}

type Callback = Box<dyn FnMut() -> Result<()>>;

struct Entry {
    id: u64,
    period: f64,
    remaining: Cell<f64>,
    repeating: bool,
    active: Cell<bool>,
    callback: RefCell<Callback>,
}

impl Entry {
    fn fire(&self) -> Result<()> {
        let mut callback = self.callback.borrow_mut();
        (callback)()
    }
}

/// Handle to a scheduled callback.
#[derive(Clone)]
pub struct Timer {
    entry: Rc<Entry>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.entry.id)
            .field("period", &self.entry.period)
            .field("remaining", &self.remaining())
            .field("repeating", &self.entry.repeating)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Timer {
    /// Time left until the next firing, in seconds. Left at zero or below
    /// right after a repeating timer fires; the next update wraps it.
    pub fn remaining(&self) -> f64 {
        self.entry.remaining.get()
    }

    pub fn period(&self) -> f64 {
        self.entry.period
    }

    pub fn is_repeating(&self) -> bool {
        self.entry.repeating
    }

    /// `false` once cancelled, or once a one-shot timer has fired.
    pub fn is_active(&self) -> bool {
        self.entry.active.get()
    }

    /// Stop the timer. Returns whether it was still active.
    pub fn cancel(&self) -> bool {
        self.entry.active.replace(false)
    }
}

struct Inner {
    entries: RefCell<Vec<Rc<Entry>>>,
    /// Timers created while an update is running; they join afterwards.
    incoming: RefCell<Vec<Rc<Entry>>>,
    updating: Cell<bool>,
    catch_up: Cell<CatchUp>,
    next_id: Cell<u64>,
}

/// Delayed and periodic callbacks advanced by a per-frame time delta.
///
/// A cheap handle: clones refer to the same schedule, so callbacks may hold a
/// clone and schedule further timers while they run.
#[derive(Clone)]
pub struct TimerScheduler {
    inner: Rc<Inner>,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("timers", &self.len())
            .field("catch_up", &self.inner.catch_up.get())
            .finish()
    }
}

/// Negative and NaN durations count as zero.
fn non_negative(secs: f64) -> f64 {
    secs.max(0.0)
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                entries: RefCell::new(Vec::new()),
                incoming: RefCell::new(Vec::new()),
                updating: Cell::new(false),
                catch_up: Cell::new(CatchUp::default()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Builder-style variant of [`set_catch_up`](Self::set_catch_up).
    pub fn with_catch_up(self, catch_up: CatchUp) -> Self {
        self.set_catch_up(catch_up);
        self
    }

    pub fn set_catch_up(&self, catch_up: CatchUp) {
        self.inner.catch_up.set(catch_up);
    }

    pub fn catch_up(&self) -> CatchUp {
        self.inner.catch_up.get()
    }

    fn schedule(&self, secs: f64, repeating: bool, callback: Callback) -> Timer {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let secs = non_negative(secs);
        let entry = Rc::new(Entry {
            id,
            period: secs,
            remaining: Cell::new(secs),
            repeating,
            active: Cell::new(true),
            callback: RefCell::new(callback),
        });
        tracing::trace!(timer = id, secs, repeating, "timer scheduled");
        if self.inner.updating.get() {
            self.inner.incoming.borrow_mut().push(entry.clone());
        } else {
            self.inner.entries.borrow_mut().push(entry.clone());
        }
        Timer { entry }
    }

    /// Call `callback` once, after `delay` seconds.
    pub fn after<F>(&self, delay: f64, callback: F) -> Timer
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.schedule(delay, false, Box::new(callback))
    }

    /// Call `callback` every `period` seconds, starting one period from now.
    pub fn every<F>(&self, period: f64, callback: F) -> Timer
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.schedule(period, true, Box::new(callback))
    }

    /// Stop `timer`. Returns whether it was still active.
    pub fn cancel(&self, timer: &Timer) -> bool {
        timer.cancel()
    }

    /// Cancel every timer.
    pub fn clear(&self) {
        for entry in self.inner.entries.borrow().iter() {
            entry.active.set(false);
        }
        for entry in self.inner.incoming.borrow_mut().drain(..) {
            entry.active.set(false);
        }
    }

    /// Number of active timers.
    pub fn len(&self) -> usize {
        let live = |entries: &[Rc<Entry>]| entries.iter().filter(|e| e.active.get()).count();
        live(&self.inner.entries.borrow()[..]) + live(&self.inner.incoming.borrow()[..])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance every timer by `dt` seconds, firing those that expire.
    ///
    /// Per repeating timer: a remaining time at or below zero is first wrapped
    /// forward by one period, then `dt` is subtracted, and the callback fires
    /// if the result is at or below zero. One-shot timers fire once and are
    /// discarded.
    ///
    /// A callback error stops the update and is returned as is. Calling
    /// `update` from inside a timer callback does nothing.
    pub fn update(&self, dt: f64) -> Result<()> {
        if self.inner.updating.replace(true) {
            tracing::warn!("ignoring nested TimerScheduler::update from a timer callback");
            return Ok(());
        }
        let result = self.advance(non_negative(dt));
        self.inner.updating.set(false);
        self.settle();
        result
    }

    fn advance(&self, dt: f64) -> Result<()> {
        let catch_up = self.inner.catch_up.get();
        let count = self.inner.entries.borrow().len();
        for index in 0..count {
            let entry = self.inner.entries.borrow()[index].clone();
            if !entry.active.get() {
                continue;
            }

            if entry.repeating && entry.remaining.get() <= 0.0 {
                entry.remaining.set(entry.remaining.get() + entry.period);
            }
            entry.remaining.set(entry.remaining.get() - dt);
            if entry.remaining.get() > 0.0 {
                continue;
            }

            if !entry.repeating {
                entry.active.set(false);
                entry.fire()?;
                continue;
            }

            entry.fire()?;
            if let CatchUp::Bounded(max) = catch_up {
                let mut fired = 1;
                while fired < max
                    && entry.active.get()
                    && entry.remaining.get() + entry.period <= 0.0
                {
                    entry.remaining.set(entry.remaining.get() + entry.period);
                    entry.fire()?;
                    fired += 1;
                }
            }
        }
        Ok(())
    }

    /// Drop finished timers and admit the ones created during the update.
    fn settle(&self) {
        let mut entries = self.inner.entries.borrow_mut();
        entries.retain(|e| e.active.get());
        entries.extend(
            self.inner
                .incoming
                .borrow_mut()
                .drain(..)
                .filter(|e| e.active.get()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    const EPS: f64 = 1e-9;

    fn counter() -> (Rc<Cell<u32>>, impl FnMut() -> Result<()> + 'static) {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        (count, move || {
            c.set(c.get() + 1);
            Ok(())
        })
    }

    #[test]
    fn catch_up_from_config() {
        assert_eq!(CatchUp::from(&TimerConfig::default()), CatchUp::AtMostOnce);
        let config = TimerConfig {
            catch_up: true,
            max_catch_up: 4,
        };
        assert_eq!(CatchUp::from(&config), CatchUp::Bounded(4));
    }

    #[test]
    fn every_wraps_without_drift() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let timer = timers.every(2.0, cb);
        assert!((timer.remaining() - 2.0).abs() < EPS);
        assert_eq!(count.get(), 0);

        timers.update(1.0).unwrap();
        assert!((timer.remaining() - 1.0).abs() < EPS);
        assert_eq!(count.get(), 0);

        timers.update(1.0).unwrap();
        assert!(timer.remaining().abs() < EPS);
        assert_eq!(count.get(), 1);

        timers.update(1.0).unwrap();
        assert!((timer.remaining() - 1.0).abs() < EPS);
        assert_eq!(count.get(), 1);

        timers.update(1.0).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn overshoot_is_carried_into_next_period() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let timer = timers.every(1.0, cb);

        timers.update(1.25).unwrap();
        assert_eq!(count.get(), 1);
        assert!((timer.remaining() + 0.25).abs() < EPS);

        timers.update(0.75).unwrap();
        assert_eq!(count.get(), 2);
        assert!(timer.remaining().abs() < EPS);
    }

    #[test]
    fn at_most_once_per_update_by_default() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        timers.every(1.0, cb);
        timers.update(5.0).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn bounded_catch_up_fires_per_elapsed_period() {
        let timers = TimerScheduler::new().with_catch_up(CatchUp::Bounded(8));
        let (count, cb) = counter();
        let timer = timers.every(1.0, cb);

        timers.update(3.5).unwrap();
        assert_eq!(count.get(), 3);
        assert!((timer.remaining() + 0.5).abs() < EPS);

        timers.update(0.5).unwrap();
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn bounded_catch_up_respects_limit() {
        let timers = TimerScheduler::new().with_catch_up(CatchUp::Bounded(2));
        let (count, cb) = counter();
        timers.every(1.0, cb);
        timers.update(10.0).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn after_fires_once_and_is_discarded() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let timer = timers.after(0.5, cb);
        assert!(!timer.is_repeating());

        timers.update(0.25).unwrap();
        assert_eq!(count.get(), 0);
        timers.update(0.25).unwrap();
        assert_eq!(count.get(), 1);
        assert!(!timer.is_active());
        assert!(timers.is_empty());

        timers.update(10.0).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn cancel_stops_future_fires() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let timer = timers.every(1.0, cb);
        timers.update(1.0).unwrap();
        assert!(timers.cancel(&timer));
        assert!(!timer.cancel());
        timers.update(1.0).unwrap();
        timers.update(1.0).unwrap();
        assert_eq!(count.get(), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn timer_scheduled_from_callback_joins_after_update() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let cb = Rc::new(RefCell::new(Some(cb)));
        let inner = timers.clone();
        timers.after(1.0, move || {
            if let Some(cb) = cb.borrow_mut().take() {
                inner.after(1.0, cb);
            }
            Ok(())
        });
        assert_eq!(timers.len(), 1);

        timers.update(1.0).unwrap();
        assert_eq!(count.get(), 0);
        assert_eq!(timers.len(), 1);

        timers.update(1.0).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn cancelled_during_update_does_not_fire() {
        let timers = TimerScheduler::new();
        let victim: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
        let v = victim.clone();
        timers.after(1.0, move || {
            if let Some(timer) = v.borrow().as_ref() {
                timer.cancel();
            }
            Ok(())
        });
        let (count, cb) = counter();
        *victim.borrow_mut() = Some(timers.every(1.0, cb));

        timers.update(1.0).unwrap();
        assert_eq!(count.get(), 0);
        assert!(timers.is_empty());
    }

    #[test]
    fn callback_error_propagates() {
        let timers = TimerScheduler::new();
        timers.after(0.1, || bail!("boom"));
        let (count, cb) = counter();
        timers.every(0.1, cb);

        let err = timers.update(0.1).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(count.get(), 0);
        assert_eq!(timers.len(), 1);

        timers.update(0.1).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn nested_update_is_ignored() {
        let timers = TimerScheduler::new();
        let inner = timers.clone();
        let (count, mut cb) = counter();
        timers.every(1.0, move || {
            inner.update(1.0)?;
            cb()
        });
        timers.update(1.0).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn clear_cancels_everything() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let a = timers.every(1.0, cb);
        timers.after(1.0, || Ok(()));
        assert_eq!(timers.len(), 2);
        timers.clear();
        assert!(timers.is_empty());
        assert!(!a.is_active());
        timers.update(2.0).unwrap();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn negative_dt_and_delay_clamp_to_zero() {
        let timers = TimerScheduler::new();
        let (count, cb) = counter();
        let timer = timers.after(-3.0, cb);
        assert_eq!(timer.remaining(), 0.0);
        timers.update(-1.0).unwrap();
        assert_eq!(count.get(), 1);
    }
}

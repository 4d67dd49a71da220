//! Building blocks for writing scripts without hand-rolled state machines.

use std::collections::VecDeque;

use anyhow::{bail, Result};

use crate::bus::EventBus;
use crate::script::{Script, ScriptContext, Step, Wait};

/// A script backed by a closure that is called on every resumption.
pub struct FnScript<F> {
    f: F,
}

pub fn from_fn<F>(f: F) -> FnScript<F>
where
    F: FnMut(&mut ScriptContext<'_>) -> Result<Step>,
{
    FnScript { f }
}

impl<F> Script for FnScript<F>
where
    F: FnMut(&mut ScriptContext<'_>) -> Result<Step>,
{
    fn resume(&mut self, cx: &mut ScriptContext<'_>) -> Result<Step> {
        (self.f)(cx)
    }
}

/// Runs `body` with an extra time-scale factor on the task's stack.
///
/// The factor is pushed when the body first runs and popped when the body
/// finishes or fails, so it stays in effect across every suspension in
/// between.
pub struct Scaled<S> {
    factor: f64,
    body: S,
    entered: bool,
}

pub fn scaled<S: Script>(factor: f64, body: S) -> Scaled<S> {
    Scaled {
        factor,
        body,
        entered: false,
    }
}

impl<S: Script> Script for Scaled<S> {
    fn resume(&mut self, cx: &mut ScriptContext<'_>) -> Result<Step> {
        if !self.entered {
            if !(self.factor.is_finite() && self.factor > 0.0) {
                bail!("time scale must be positive and finite, got {}", self.factor);
            }
            cx.push_time_scale(self.factor);
            self.entered = true;
        }

        let step = self.body.resume(cx);
        if !matches!(step, Ok(Step::Wait(_))) {
            cx.pop_time_scale();
            self.entered = false;
        }
        step
    }
}

/// Runs every script in parallel as a child task and finishes once all of
/// them are done.
pub struct Combine {
    children: Option<Vec<Box<dyn Script>>>,
}

pub fn combine<I>(scripts: I) -> Combine
where
    I: IntoIterator<Item = Box<dyn Script>>,
{
    Combine {
        children: Some(scripts.into_iter().collect()),
    }
}

impl Script for Combine {
    fn resume(&mut self, _cx: &mut ScriptContext<'_>) -> Result<Step> {
        Ok(match self.children.take() {
            Some(children) => Step::Wait(Wait::All(children)),
            None => Step::Done,
        })
    }
}

/// Runs a fresh body from `make` for as long as `cond` holds.
///
/// `cond` is checked before each iteration. An iteration that finishes
/// without suspending yields a zero-length sleep so the loop advances at most
/// once per frame.
pub struct RepeatWhile<C, F, S> {
    cond: C,
    make: F,
    current: Option<S>,
    suspended: bool,
}

pub fn repeat_while<C, F, S>(cond: C, make: F) -> RepeatWhile<C, F, S>
where
    C: FnMut() -> bool,
    F: FnMut() -> S,
    S: Script,
{
    RepeatWhile {
        cond,
        make,
        current: None,
        suspended: false,
    }
}

impl<C, F, S> Script for RepeatWhile<C, F, S>
where
    C: FnMut() -> bool,
    F: FnMut() -> S,
    S: Script,
{
    fn resume(&mut self, cx: &mut ScriptContext<'_>) -> Result<Step> {
        loop {
            let body = match &mut self.current {
                Some(body) => body,
                None => {
                    if !(self.cond)() {
                        return Ok(Step::Done);
                    }
                    self.suspended = false;
                    self.current.insert((self.make)())
                }
            };

            match body.resume(cx)? {
                Step::Wait(wait) => {
                    self.suspended = true;
                    return Ok(Step::Wait(wait));
                }
                Step::Done => {
                    self.current = None;
                    if !self.suspended {
                        return Ok(Step::sleep(0.0));
                    }
                }
            }
        }
    }
}

type Call = Box<dyn FnOnce(&mut ScriptContext<'_>) -> Result<()>>;

enum Action {
    Call(Call),
    Wait(Wait),
    Run(Box<dyn Script>),
}

/// A linear script assembled from actions and waits.
///
/// ```ignore
/// let intro = Sequence::new()
///     .call(|_| Ok(println!("ready")))
///     .sleep(0.5)
///     .wait_event(&keys, |k: &Key| k.is_enter())
///     .combine(vec![left, right]);
/// ```
#[derive(Default)]
pub struct Sequence {
    actions: VecDeque<Action>,
    running: Option<Box<dyn Script>>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` synchronously when the sequence reaches it.
    pub fn call<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut ScriptContext<'_>) -> Result<()> + 'static,
    {
        self.actions.push_back(Action::Call(Box::new(f)));
        self
    }

    pub fn sleep(mut self, secs: f64) -> Self {
        self.actions.push_back(Action::Wait(Wait::Sleep(secs)));
        self
    }

    pub fn wait_event<E, M>(mut self, bus: &EventBus<E>, matcher: M) -> Self
    where
        E: 'static,
        M: Fn(&E) -> bool + 'static,
    {
        self.actions.push_back(Action::Wait(Wait::event(bus, matcher)));
        self
    }

    /// Run a nested script to completion in this task.
    pub fn run<S: Script + 'static>(mut self, script: S) -> Self {
        self.actions.push_back(Action::Run(Box::new(script)));
        self
    }

    pub fn combine<I>(self, scripts: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Script>>,
    {
        self.run(combine(scripts))
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.running.is_none()
    }
}

impl Script for Sequence {
    fn resume(&mut self, cx: &mut ScriptContext<'_>) -> Result<Step> {
        loop {
            if let Some(script) = &mut self.running {
                match script.resume(cx)? {
                    Step::Wait(wait) => return Ok(Step::Wait(wait)),
                    Step::Done => self.running = None,
                }
            }

            match self.actions.pop_front() {
                None => return Ok(Step::Done),
                Some(Action::Call(f)) => f(cx)?,
                Some(Action::Wait(wait)) => return Ok(Step::Wait(wait)),
                Some(Action::Run(script)) => self.running = Some(script),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScriptScheduler;
    use crate::task::TaskState;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const EPS: f64 = 1e-9;

    type Log = Rc<RefCell<Vec<String>>>;

    fn note(log: &Log, line: &str) -> impl FnOnce(&mut ScriptContext<'_>) -> Result<()> + 'static {
        let log = log.clone();
        let line = line.to_string();
        move |_cx| {
            log.borrow_mut().push(line);
            Ok(())
        }
    }

    fn record_scale(into: &Rc<Cell<f64>>) -> impl Script + 'static {
        let into = into.clone();
        from_fn(move |cx| {
            into.set(cx.time_scale());
            Ok(Step::Done)
        })
    }

    #[test]
    fn sequence_runs_actions_in_order() {
        let sched = ScriptScheduler::new();
        let bus: EventBus<char> = EventBus::new();
        let log: Log = Rc::default();
        let seq = Sequence::new()
            .call(note(&log, "a"))
            .sleep(1.0)
            .call(note(&log, "b"))
            .wait_event(&bus, |c| *c == 'x')
            .call(note(&log, "c"));
        let task = sched.spawn(seq);

        sched.update(0.0).unwrap();
        assert_eq!(*log.borrow(), ["a"]);
        sched.update(1.0).unwrap();
        assert_eq!(*log.borrow(), ["a", "b"]);
        bus.dispatch(&'y').unwrap();
        sched.update(0.0).unwrap();
        assert_eq!(log.borrow().len(), 2);
        bus.dispatch(&'x').unwrap();
        sched.update(0.0).unwrap();
        assert_eq!(*log.borrow(), ["a", "b", "c"]);
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn empty_sequence_finishes_immediately() {
        let sched = ScriptScheduler::new();
        let seq = Sequence::new();
        assert!(seq.is_empty());
        let task = sched.spawn(seq);
        sched.update(0.0).unwrap();
        assert!(task.is_finished());
    }

    #[test]
    fn nested_scales_multiply_and_unwind() {
        let sched = ScriptScheduler::new();
        let (inner, after) = (Rc::new(Cell::new(0.0)), Rc::new(Cell::new(0.0)));
        let body = Sequence::new()
            .run(scaled(3.0, record_scale(&inner)))
            .run(record_scale(&after));
        sched.spawn(scaled(2.0, body));
        sched.update(0.0).unwrap();
        assert!((inner.get() - 6.0).abs() < EPS);
        assert!((after.get() - 2.0).abs() < EPS);
    }

    #[test]
    fn scale_stays_active_across_suspension() {
        let sched = ScriptScheduler::new();
        let seen = Rc::new(Cell::new(0.0));
        sched.spawn(scaled(
            4.0,
            Sequence::new().sleep(1.0).run(record_scale(&seen)),
        ));
        sched.update(0.0).unwrap();
        sched.update(0.25).unwrap();
        assert!((seen.get() - 4.0).abs() < EPS);
    }

    #[test]
    fn invalid_scale_fails_task() {
        let sched = ScriptScheduler::new();
        let task = sched.spawn_named("bad", scaled(0.0, Sequence::new()));
        let err = sched.update(0.0).unwrap_err();
        assert_eq!(task.state(), TaskState::Failed);
        assert!(format!("{:#}", err).contains("time scale must be positive"));
    }

    #[test]
    fn combine_children_see_parent_scale() {
        let sched = ScriptScheduler::new();
        let (a, b) = (Rc::new(Cell::new(0.0)), Rc::new(Cell::new(0.0)));
        sched.spawn(scaled(
            2.0,
            combine(vec![
                Box::new(record_scale(&a)) as Box<dyn Script>,
                Box::new(scaled(5.0, record_scale(&b))),
            ]),
        ));
        sched.update(0.0).unwrap();
        assert!((a.get() - 2.0).abs() < EPS);
        assert!((b.get() - 10.0).abs() < EPS);
    }

    #[test]
    fn empty_combine_finishes_in_one_frame() {
        let sched = ScriptScheduler::new();
        let task = sched.spawn(combine(Vec::new()));
        sched.update(0.0).unwrap();
        assert!(task.is_finished());
    }

    #[test]
    fn repeat_while_loops_until_condition_fails() {
        let sched = ScriptScheduler::new();
        let count = Rc::new(Cell::new(0));
        let (c, body_count) = (count.clone(), count.clone());
        let task = sched.spawn(repeat_while(
            move || c.get() < 3,
            move || {
                let body_count = body_count.clone();
                Sequence::new().sleep(0.5).call(move |_cx| {
                    body_count.set(body_count.get() + 1);
                    Ok(())
                })
            },
        ));

        sched.update(0.0).unwrap();
        for _ in 0..3 {
            sched.update(0.5).unwrap();
        }
        assert_eq!(count.get(), 3);
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn repeat_while_instant_body_advances_once_per_frame() {
        let sched = ScriptScheduler::new();
        let count = Rc::new(Cell::new(0));
        let body_count = count.clone();
        let task = sched.spawn(repeat_while(
            || true,
            move || {
                let body_count = body_count.clone();
                from_fn(move |_cx| {
                    body_count.set(body_count.get() + 1);
                    Ok(Step::Done)
                })
            },
        ));

        for _ in 0..4 {
            sched.update(0.016).unwrap();
        }
        assert_eq!(count.get(), 4);
        assert_eq!(task.state(), TaskState::Suspended);
        task.stop();
        sched.update(0.016).unwrap();
        assert!(task.was_stopped());
    }

    #[test]
    fn call_error_stops_the_sequence() {
        let sched = ScriptScheduler::new();
        let log: Log = Rc::default();
        let task = sched.spawn(
            Sequence::new()
                .call(|_cx| bail!("no such sprite"))
                .call(note(&log, "unreachable")),
        );
        assert!(sched.update(0.0).is_err());
        assert_eq!(task.state(), TaskState::Failed);
        assert!(log.borrow().is_empty());
    }
}

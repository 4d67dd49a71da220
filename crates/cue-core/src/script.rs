use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use anyhow::Result;

use crate::bus::{EventBus, Subscription};
use crate::task::{TaskHandle, TaskId};

/// A resumable sequence of actions.
///
/// Each call to [`resume`](Script::resume) runs the body synchronously up to
/// its next suspension point and describes that point as data. The scheduler
/// calls `resume` again once the wait is satisfied. Returning an error fails
/// the task.
pub trait Script {
    fn resume(&mut self, cx: &mut ScriptContext<'_>) -> Result<Step>;
}

impl<S: Script + ?Sized> Script for Box<S> {
    fn resume(&mut self, cx: &mut ScriptContext<'_>) -> Result<Step> {
        (**self).resume(cx)
    }
}

/// Outcome of one resumption.
pub enum Step {
    /// Suspend until the wait is satisfied.
    Wait(Wait),
    /// The script has finished.
    Done,
}

impl Step {
    pub fn sleep(secs: f64) -> Self {
        Step::Wait(Wait::Sleep(secs))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Wait(wait) => f.debug_tuple("Wait").field(wait).finish(),
            Step::Done => f.write_str("Done"),
        }
    }
}

/// A suspension point.
pub enum Wait {
    /// Resume once this many seconds of task time have passed. Task time runs
    /// at the task's time scale when the wait was issued.
    Sleep(f64),
    /// Resume after a matching event is dispatched on a bus.
    Event(EventWait),
    /// Run each script as a child task; resume once all of them are done.
    All(Vec<Box<dyn Script>>),
}

impl Wait {
    pub fn event<E, M>(bus: &EventBus<E>, matcher: M) -> Self
    where
        E: 'static,
        M: Fn(&E) -> bool + 'static,
    {
        Wait::Event(EventWait::new(bus, matcher))
    }

    pub fn all<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Script>>,
    {
        Wait::All(scripts.into_iter().collect())
    }
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wait::Sleep(secs) => f.debug_tuple("Sleep").field(secs).finish(),
            Wait::Event(_) => f.write_str("Event"),
            Wait::All(children) => f.debug_tuple("All").field(&children.len()).finish(),
        }
    }
}

type Arm = Box<dyn FnOnce(Rc<Cell<bool>>) -> Box<dyn Disarm>>;

/// A wait on the next event of a bus that satisfies a matcher.
///
/// Nothing is subscribed until a task actually suspends on it; the
/// subscription is removed again when the task resumes, stops or is dropped.
pub struct EventWait {
    arm: Arm,
}

impl EventWait {
    pub fn new<E, M>(bus: &EventBus<E>, matcher: M) -> Self
    where
        E: 'static,
        M: Fn(&E) -> bool + 'static,
    {
        let bus = bus.clone();
        Self {
            arm: Box::new(move |woken| {
                let subscription = bus.connect(move |event: &E| {
                    if !woken.get() && matcher(event) {
                        woken.set(true);
                    }
                    Ok(())
                });
                Box::new(subscription) as Box<dyn Disarm>
            }),
        }
    }

    pub(crate) fn arm(self) -> ArmedEvent {
        let woken = Rc::new(Cell::new(false));
        let subscription = (self.arm)(woken.clone());
        ArmedEvent {
            woken,
            subscription,
        }
    }
}

/// Type-erased removal of the subscription backing an armed [`EventWait`].
pub(crate) trait Disarm {
    fn disarm(&self);
}

impl<E: 'static> Disarm for Subscription<E> {
    fn disarm(&self) {
        self.disconnect();
    }
}

pub(crate) struct ArmedEvent {
    woken: Rc<Cell<bool>>,
    subscription: Box<dyn Disarm>,
}

impl ArmedEvent {
    pub(crate) fn is_woken(&self) -> bool {
        self.woken.get()
    }
}

impl Drop for ArmedEvent {
    fn drop(&mut self) {
        self.subscription.disarm();
    }
}

/// What a script can see of the task running it.
pub struct ScriptContext<'a> {
    task: &'a TaskHandle,
    scales: &'a mut Vec<f64>,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(task: &'a TaskHandle, scales: &'a mut Vec<f64>) -> Self {
        Self { task, scales }
    }

    pub fn task(&self) -> &TaskHandle {
        self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    /// Product of every active time-scale scope. Sleeps issued now advance
    /// this many times faster than frame time.
    pub fn time_scale(&self) -> f64 {
        self.scales.iter().product()
    }

    /// Whether someone asked this task to stop. The task stops at its next
    /// suspension point regardless; long synchronous bodies may check this to
    /// bail out early.
    pub fn stop_requested(&self) -> bool {
        self.task.stop_requested()
    }

    pub(crate) fn push_time_scale(&mut self, factor: f64) {
        self.scales.push(factor);
    }

    pub(crate) fn pop_time_scale(&mut self) {
        self.scales.pop();
    }
}

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use anyhow::{Error, Result};

use crate::script::{ArmedEvent, Script, ScriptContext, Step, Wait};

/// Identifier of a task, unique within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a task.
///
/// `Created -> Running -> (Suspended <-> Running)* -> Done`, with `Failed`
/// reachable from `Running` or `Suspended`. A stopped task ends in `Done`
/// with [`TaskHandle::was_stopped`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Suspended,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Running => write!(f, "running"),
            TaskState::Suspended => write!(f, "suspended"),
            TaskState::Done => write!(f, "done"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

struct Shared {
    id: TaskId,
    name: String,
    state: Cell<TaskState>,
    stop: Cell<bool>,
    stopped: Cell<bool>,
}

/// Observer and stop switch for a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Rc<Shared>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    fn new(id: TaskId, name: String) -> Self {
        Self {
            shared: Rc::new(Shared {
                id,
                name,
                state: Cell::new(TaskState::Created),
                stop: Cell::new(false),
                stopped: Cell::new(false),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Ask the task to stop. Honoured at its next suspension check; a body
    /// that is currently running is never interrupted.
    pub fn stop(&self) {
        self.shared.stop.set(true);
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.get()
    }

    /// Whether the task ended because of a stop request.
    pub fn was_stopped(&self) -> bool {
        self.shared.stopped.get()
    }

    fn set_state(&self, state: TaskState) {
        self.shared.state.set(state);
    }
}

/// Source of task ids shared by a scheduler and every task it owns.
#[derive(Clone, Default)]
pub(crate) struct TaskIds(Rc<Cell<u64>>);

impl TaskIds {
    pub(crate) fn next(&self) -> TaskId {
        let id = self.0.get();
        self.0.set(id + 1);
        TaskId(id)
    }
}

enum Suspension {
    /// Not started yet, or currently running.
    Idle,
    Sleep { remaining: f64, scale: f64 },
    Event(ArmedEvent),
    All(Vec<Task>),
}

/// A script plus the state needed to drive it.
pub(crate) struct Task {
    handle: TaskHandle,
    script: Box<dyn Script>,
    suspension: Suspension,
    /// Time-scale stack; the bottom entry is the scale inherited from the
    /// parent, if any.
    scales: Vec<f64>,
    ids: TaskIds,
}

impl Task {
    pub(crate) fn new(
        ids: TaskIds,
        name: Option<String>,
        script: Box<dyn Script>,
        inherited_scale: Option<f64>,
    ) -> Self {
        let id = ids.next();
        let name = name.unwrap_or_else(|| format!("task{}", id));
        Self {
            handle: TaskHandle::new(id, name),
            script,
            suspension: Suspension::Idle,
            scales: inherited_scale.into_iter().collect(),
            ids,
        }
    }

    pub(crate) fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn time_scale(&self) -> f64 {
        self.scales.iter().product()
    }

    /// Advance the task by one frame of `dt` seconds.
    pub(crate) fn step(&mut self, dt: f64) -> Result<()> {
        let state = self.handle.state();
        if state.is_finished() {
            return Ok(());
        }
        if self.handle.stop_requested() {
            self.halt();
            return Ok(());
        }

        let ready = match &mut self.suspension {
            Suspension::Idle => Ok(state == TaskState::Created),
            Suspension::Sleep { remaining, scale } => {
                *remaining -= dt * *scale;
                Ok(*remaining <= 0.0)
            }
            Suspension::Event(armed) => Ok(armed.is_woken()),
            Suspension::All(children) => step_children(children, dt),
        };

        match ready {
            Ok(true) => self.resume(),
            Ok(false) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Run the body to its next suspension point. A wait on children that
    /// all finish immediately resumes the body again right away.
    fn resume(&mut self) -> Result<()> {
        loop {
            self.suspension = Suspension::Idle;
            self.handle.set_state(TaskState::Running);

            let step = {
                let mut cx = ScriptContext::new(&self.handle, &mut self.scales);
                self.script.resume(&mut cx)
            };
            let wait = match step {
                Ok(Step::Wait(wait)) => wait,
                Ok(Step::Done) => {
                    self.complete();
                    return Ok(());
                }
                Err(err) => return Err(self.fail(err)),
            };

            if self.handle.stop_requested() {
                self.halt();
                return Ok(());
            }
            match self.suspend(wait) {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Enter `wait`. Returns `true` if it is already satisfied.
    fn suspend(&mut self, wait: Wait) -> Result<bool> {
        let scale = self.time_scale();
        self.handle.set_state(TaskState::Suspended);
        tracing::trace!(task = %self.handle.id(), ?wait, scale, "task suspended");
        match wait {
            Wait::Sleep(secs) => {
                self.suspension = Suspension::Sleep {
                    remaining: secs.max(0.0),
                    scale,
                };
                Ok(false)
            }
            Wait::Event(wait) => {
                self.suspension = Suspension::Event(wait.arm());
                Ok(false)
            }
            Wait::All(scripts) => {
                let parent = self.handle.name().to_string();
                let mut children: Vec<Task> = scripts
                    .into_iter()
                    .enumerate()
                    .map(|(i, script)| {
                        let name = format!("{}/{}", parent, i);
                        Task::new(self.ids.clone(), Some(name), script, Some(scale))
                    })
                    .collect();
                let started = start_children(&mut children);
                let done = children.iter().all(|c| c.handle.is_finished());
                self.suspension = Suspension::All(children);
                started.map(|()| done)
            }
        }
    }

    fn complete(&mut self) {
        self.suspension = Suspension::Idle;
        self.scales.clear();
        self.handle.set_state(TaskState::Done);
        tracing::debug!(task = %self.handle.id(), name = self.handle.name(), "task done");
    }

    /// Finish at a suspension point because a stop was requested. Children
    /// are stopped the same way.
    fn halt(&mut self) {
        if let Suspension::All(children) = &mut self.suspension {
            stop_siblings(children);
        }
        self.suspension = Suspension::Idle;
        self.scales.clear();
        self.handle.shared.stopped.set(true);
        self.handle.set_state(TaskState::Done);
        tracing::debug!(task = %self.handle.id(), name = self.handle.name(), "task stopped");
    }

    fn fail(&mut self, err: Error) -> Error {
        if let Suspension::All(children) = &mut self.suspension {
            stop_siblings(children);
        }
        self.suspension = Suspension::Idle;
        self.scales.clear();
        self.handle.set_state(TaskState::Failed);
        tracing::warn!(
            task = %self.handle.id(),
            name = self.handle.name(),
            error = %err,
            "task failed"
        );
        err.context(format!("script task {} failed", self.handle.name()))
    }
}

/// Run freshly created children up to their first suspension point.
fn start_children(children: &mut [Task]) -> Result<()> {
    for index in 0..children.len() {
        if let Err(err) = children[index].resume() {
            stop_siblings(children);
            return Err(err);
        }
    }
    Ok(())
}

/// Step every child; `Ok(true)` once all of them are done.
fn step_children(children: &mut [Task], dt: f64) -> Result<bool> {
    for index in 0..children.len() {
        if let Err(err) = children[index].step(dt) {
            stop_siblings(children);
            return Err(err);
        }
    }
    Ok(children.iter().all(|c| c.handle.is_finished()))
}

/// Stop every unfinished child. They are all parked at a suspension point, so
/// this is where they would have checked the request anyway.
fn stop_siblings(children: &mut [Task]) {
    for child in children.iter_mut() {
        if !child.handle.is_finished() {
            child.handle.stop();
            child.halt();
        }
    }
}

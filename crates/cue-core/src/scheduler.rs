use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use anyhow::Result;

use crate::script::Script;
use crate::task::{Task, TaskHandle, TaskIds};

#[derive(Default)]
struct Inner {
    tasks: RefCell<Vec<Task>>,
    /// Tasks spawned while an update is running; they join after the pass.
    incoming: RefCell<Vec<Task>>,
    handles: RefCell<Vec<TaskHandle>>,
    updating: Cell<bool>,
    ids: TaskIds,
}

/// Drives top-level script tasks, one step per frame, in spawn order.
#[derive(Clone, Default)]
pub struct ScriptScheduler {
    inner: Rc<Inner>,
}

impl fmt::Debug for ScriptScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptScheduler")
            .field("tasks", &self.len())
            .field("updating", &self.inner.updating.get())
            .finish()
    }
}

impl ScriptScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `script` as a new task. It first runs during the next update.
    pub fn spawn<S: Script + 'static>(&self, script: S) -> TaskHandle {
        self.insert(None, Box::new(script))
    }

    pub fn spawn_named<S: Script + 'static>(&self, name: impl Into<String>, script: S) -> TaskHandle {
        self.insert(Some(name.into()), Box::new(script))
    }

    fn insert(&self, name: Option<String>, script: Box<dyn Script>) -> TaskHandle {
        let task = Task::new(self.inner.ids.clone(), name, script, None);
        let handle = task.handle().clone();
        tracing::debug!(task = %handle.id(), name = handle.name(), "task spawned");

        if self.inner.updating.get() {
            self.inner.incoming.borrow_mut().push(task);
        } else {
            self.inner.tasks.borrow_mut().push(task);
        }
        self.inner.handles.borrow_mut().push(handle.clone());
        handle
    }

    /// Advance every task by `dt` seconds.
    ///
    /// Stops at the first task that fails and returns its error; tasks after
    /// it are not stepped this frame. Finished tasks are dropped.
    pub fn update(&self, dt: f64) -> Result<()> {
        if self.inner.updating.get() {
            tracing::warn!("nested ScriptScheduler::update ignored");
            return Ok(());
        }
        self.inner.updating.set(true);

        let dt = dt.max(0.0);
        let mut tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        let mut result = Ok(());
        for task in tasks.iter_mut() {
            if let Err(err) = task.step(dt) {
                result = Err(err);
                break;
            }
        }

        tasks.retain(|task| !task.handle().is_finished());
        tasks.append(&mut self.inner.incoming.borrow_mut());
        *self.inner.tasks.borrow_mut() = tasks;
        self.inner
            .handles
            .borrow_mut()
            .retain(|handle| !handle.is_finished());
        self.inner.updating.set(false);
        result
    }

    /// Ask every task to stop at its next suspension check.
    pub fn stop_all(&self) {
        for handle in self.inner.handles.borrow().iter() {
            handle.stop();
        }
    }

    /// Number of unfinished top-level tasks.
    pub fn len(&self) -> usize {
        self.inner
            .handles
            .borrow()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Event dispatch and time-driven scheduling for a frame-based application.
//!
//! This crate provides three cooperating primitives driven from a single
//! thread: a reentrancy-safe publish/subscribe [`bus`], a per-frame
//! [`timer`] scheduler, and a cooperative [`scheduler`] for long-running
//! [`script`]s with parallel composition and time dilation. It also carries
//! the frame clock and logging subsystem shared by the application shell.

pub mod bus;
pub mod clock;
pub mod combinators;
pub mod logging;
pub mod scheduler;
pub mod script;
pub mod task;
pub mod timer;

pub use bus::{EventBus, Handler, Ownership, Subscription};
pub use scheduler::ScriptScheduler;
pub use script::{EventWait, Script, ScriptContext, Step, Wait};
pub use task::{TaskHandle, TaskId, TaskState};
pub use timer::{CatchUp, Timer, TimerScheduler};

//! Core data model.
//!
//! A task is something a language worker pool needs to compute. It has
//! identity (caller-supplied id), an originating client, a typed payload and
//! a creation stamp. A task result is the one-shot outcome of running it.

pub mod result;
pub mod task;

pub use result::{HEARTBEAT_FRAME, Outcome, StreamEvent, TaskResult};
pub use task::{ClientId, Language, Task, TaskId, TaskPayload};

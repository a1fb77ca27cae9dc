//! Units of work and their results
//!
//! This module provides:
//! - [`Task`] - a caller-assigned id plus a body (async or blocking)
//! - [`TaskResult`] - the single result every dequeued task produces
//! - [`TaskFailure`] - failure descriptor distinguishing errors from panics

mod definition;
mod result;

pub(crate) use definition::TaskBody;
pub use definition::{Task, TaskId};
pub use result::{FailureKind, TaskFailure, TaskOutcome, TaskResult};

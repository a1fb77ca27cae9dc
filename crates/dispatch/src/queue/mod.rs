//! Pending task storage
//!
//! [`TaskQueue`] is the only place tasks wait between submission and
//! execution. Its capacity is the backpressure knob: producers block once it
//! is full, and a capacity of zero hands tasks straight to idle workers.

mod bounded;

pub use bounded::{QueueError, TaskQueue};

//! Result fan-in
//!
//! Every worker publishes on its own channel. The merger is the single
//! owner of the output channel and closes it only after all worker
//! channels have closed, so consumers see one ordered end-of-stream.

mod fan_in;

pub(crate) use fan_in::ResultMerger;
pub use fan_in::ResultStream;

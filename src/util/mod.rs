//! Utility modules for thingcache-rs.

pub mod task;

pub use task::{CancelSignal, Task};

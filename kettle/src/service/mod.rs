//! gRPC adapters. Both translate requests into the internal API and errors
//! into statuses; neither holds state of its own.

mod containers;
mod task;

pub use containers::ContainersApi;
pub use task::TaskApi;

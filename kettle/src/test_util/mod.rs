//! Test utilities for exercising the daemon without a real OCI runtime
//!
//! This module provides a scriptable runtime and a launcher that serves shims
//! inside the test process, so the full daemon -> shim -> runtime path can run
//! over real unix sockets.

pub mod launcher;
pub mod runtime;

pub use launcher::InProcessLauncher;
pub use runtime::{MockRuntime, RuntimeCall};

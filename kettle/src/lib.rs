//! kettle - a minimal container lifecycle daemon.
//!
//! Accepts container management requests on a daemon-wide unix socket and
//! delegates the per-container work to `kettle-shim` processes, which drive an
//! OCI runtime (`runc`, `youki`, `crun`).
//!
//! ## Architecture
//!
//! - **Registry**: in-memory `(namespace, id) -> task` map with per-key guards
//! - **Shim supervisor**: launches, watches, dials and terminates shims
//! - **Task manager**: the create/start/delete orchestration on the daemon side
//! - **Local task**: the shim side, one container driven through the runtime
//! - **Services**: gRPC adapters for both surfaces

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod listener;
pub mod manager;
pub mod proto;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod shim;
pub mod task;
pub mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use task::{DEFAULT_NAMESPACE, TaskKey, TaskSnapshot, TaskState};

use std::sync::Arc;

use crate::manager::TaskManager;
use crate::registry::Registry;
use crate::runtime::{OciRuntime, Runtime};
use crate::shim::{ProcessLauncher, ShimLauncher, ShimSupervisor};

/// Wire the daemon's components from `config` with the given shim launcher
/// and runtime.
pub fn build_manager(
    config: &Config,
    launcher: Arc<dyn ShimLauncher>,
    runtime: Arc<dyn Runtime>,
) -> Arc<TaskManager> {
    let registry = Arc::new(Registry::new());
    let supervisor = ShimSupervisor::new(registry.clone(), launcher, config);
    Arc::new(TaskManager::new(registry, supervisor, runtime))
}

/// Production wiring: `kettle-shim` processes and the configured OCI runtime.
pub fn default_manager(config: &Config) -> Arc<TaskManager> {
    let launcher = ProcessLauncher::new(&config.shim_binary, &config.runtime)
        .with_runtime_root(config.runtime_root.clone())
        .with_runtime_timeout(config.runtime_timeout);
    let runtime = OciRuntime::new(&config.runtime)
        .with_root(config.runtime_root.clone())
        .with_timeout(config.runtime_timeout);

    build_manager(config, Arc::new(launcher), Arc::new(runtime))
}

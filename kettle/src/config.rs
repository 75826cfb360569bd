use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the daemon's runtime state; shim sockets live under
    /// `<state_dir>/<namespace>/<id>/shim.sock`.
    pub state_dir: PathBuf,
    /// Management socket.
    pub socket: PathBuf,
    /// Permission bits applied to the management socket.
    pub socket_mode: u32,
    /// OCI runtime binary.
    pub runtime: PathBuf,
    /// Root directory for runtime state (`--root`); runtime default when unset.
    pub runtime_root: Option<PathBuf>,
    /// Upper bound for a single runtime invocation; unbounded when unset.
    pub runtime_timeout: Option<Duration>,
    /// Shim binary launched per container.
    pub shim_binary: PathBuf,
    /// Timeout for a single dial of a shim socket.
    pub connect_timeout: Duration,
    /// Dial attempts before a shim is considered unreachable.
    pub connect_attempts: u32,
    /// Grace period between SIGTERM and SIGKILL when stopping a shim.
    pub shim_stop_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/run/kettle"),
            socket: PathBuf::from("/run/kettle/kettle.sock"),
            socket_mode: 0o666,
            runtime: PathBuf::from("runc"),
            runtime_root: None,
            runtime_timeout: None,
            shim_binary: PathBuf::from("kettle-shim"),
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 5,
            shim_stop_timeout: Duration::from_secs(5),
        }
    }
}

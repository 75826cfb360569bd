//! OCI runtime adapter.
//!
//! Shells out to an OCI-compatible runtime binary (`runc`, `youki`, `crun`).
//! Holds no state of its own; the runtime keeps its state under `--root`.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Lines of runtime stderr kept in a failure.
const STDERR_TAIL_LINES: usize = 20;
/// Bytes of runtime stderr kept in a failure.
const STDERR_TAIL_BYTES: usize = 2048;

/// Name of the pid file the runtime writes into the bundle on create.
const PID_FILE: &str = "container.pid";

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Make sure `bundle` holds a `config.json` and a `rootfs/`.
    ///
    /// Existing content is never removed or overwritten, so calling this on a
    /// prepared bundle is a no-op.
    async fn generate_bundle(&self, bundle: &Path) -> Result<()>;

    /// Create the container and return its init pid.
    async fn create_container(&self, bundle: &Path, id: &str) -> Result<u32>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Delete the container, killing it first if it is still running.
    async fn delete_container(&self, id: &str) -> Result<()>;
}

/// [`Runtime`] backed by an external OCI runtime binary.
#[derive(Debug, Clone)]
pub struct OciRuntime {
    binary: PathBuf,
    root: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl OciRuntime {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: None,
            timeout: None,
        }
    }

    /// Pass `--root <dir>` to every invocation.
    pub fn with_root(mut self, root: Option<PathBuf>) -> Self {
        self.root = root;
        self
    }

    /// Kill and fail any invocation that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: Vec<OsString>, cwd: Option<&Path>) -> Result<()> {
        let mut argv: Vec<OsString> = Vec::with_capacity(args.len() + 2);
        if let Some(root) = &self.root {
            argv.push("--root".into());
            argv.push(root.into());
        }
        argv.extend(args);

        let command_line = std::iter::once(self.binary.as_os_str())
            .chain(argv.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        info!("Runtime: Executing {command_line}");

        let failed = |exit_code: i32, stderr_tail: String| Error::RuntimeExecutionFailed {
            command: command_line.clone(),
            exit_code,
            stderr_tail,
        };

        // The container init inherits the runtime's stdio and outlives it, so
        // never wait for EOF on stderr: capture to an unlinked file instead.
        let capture = tempfile::tempfile().map_err(|e| failed(-1, e.to_string()))?;
        let child_stderr = capture.try_clone().map_err(|e| failed(-1, e.to_string()))?;

        let mut command = Command::new(&self.binary);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::from(child_stderr))
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| failed(-1, e.to_string()))?;
        drop(command);

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("Runtime: {command_line} timed out after {limit:?}");
                    return Err(failed(-1, format!("timed out after {limit:?}")));
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| failed(-1, e.to_string()))?;

        let stderr = match read_captured(&capture) {
            Ok(stderr) => stderr,
            Err(e) => {
                warn!(error = %e, "Runtime: failed to read stderr of {command_line}");
                Vec::new()
            }
        };
        for line in String::from_utf8_lossy(&stderr)
            .lines()
            .filter(|l| !l.trim().is_empty())
        {
            if status.success() {
                debug!(target: "kettle::runtime::stderr", "{line}");
            } else {
                warn!(target: "kettle::runtime::stderr", "{line}");
            }
        }

        if !status.success() {
            let exit_code = status
                .code()
                .or_else(|| status.signal().map(|sig| 128 + sig))
                .unwrap_or(-1);
            warn!(exit_code, "Runtime: {command_line} failed");
            return Err(failed(exit_code, stderr_tail(&stderr)));
        }

        debug!("Runtime: {command_line} succeeded");
        Ok(())
    }
}

#[async_trait]
impl Runtime for OciRuntime {
    async fn generate_bundle(&self, bundle: &Path) -> Result<()> {
        tokio::fs::create_dir_all(bundle).await?;

        if tokio::fs::try_exists(bundle.join("config.json")).await? {
            debug!(bundle = %bundle.display(), "Bundle already has config.json");
        } else {
            self.run(vec!["spec".into()], Some(bundle)).await?;
        }

        let rootfs = bundle.join("rootfs");
        if !tokio::fs::try_exists(&rootfs).await? {
            tokio::fs::create_dir(&rootfs).await?;
        }
        Ok(())
    }

    async fn create_container(&self, bundle: &Path, id: &str) -> Result<u32> {
        let pid_file = bundle.join(PID_FILE);
        remove_if_exists(&pid_file).await?;

        self.run(
            vec![
                "create".into(),
                "--bundle".into(),
                bundle.into(),
                "--pid-file".into(),
                pid_file.clone().into(),
                id.into(),
            ],
            None,
        )
        .await?;

        let contents = tokio::fs::read_to_string(&pid_file).await?;
        remove_if_exists(&pid_file).await?;

        let pid = contents.trim().parse::<u32>().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid pid file {}: {e}", pid_file.display()),
            )
        })?;
        info!(id, pid, "Runtime: Container created");
        Ok(pid)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(vec!["start".into(), id.into()], None).await
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        self.run(vec!["delete".into(), "--force".into(), id.into()], None)
            .await
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Everything written to `file` so far.
///
/// Reads by offset: the file description is shared with the child, and possibly
/// with a container init still writing to it.
fn read_captured(file: &File) -> io::Result<Vec<u8>> {
    let len = file.metadata()?.len() as usize;
    let mut buf = vec![0; len];
    let mut read = 0;
    while read < len {
        match file.read_at(&mut buf[read..], read as u64)? {
            0 => break,
            n => read += n,
        }
    }
    buf.truncate(read);
    Ok(buf)
}

/// Last [`STDERR_TAIL_LINES`] lines of `stderr`, capped at [`STDERR_TAIL_BYTES`].
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

    if tail.len() <= STDERR_TAIL_BYTES {
        return tail;
    }
    let mut start = tail.len() - STDERR_TAIL_BYTES;
    while !tail.is_char_boundary(start) {
        start += 1;
    }
    tail[start..].to_string()
}

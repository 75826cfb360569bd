//! Unix socket listener lifecycle.
//!
//! Binds a socket after clearing a stale file from a previous run, applies
//! permissions and removes the file again when dropped.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A bound unix socket that removes its file on drop.
#[derive(Debug)]
pub struct BoundSocket {
    path: PathBuf,
    listener: Option<UnixListener>,
}

impl BoundSocket {
    /// Bind `path` with permission bits `mode`.
    ///
    /// A leftover socket file nobody is listening on is removed first; a socket
    /// that still accepts connections is left alone and reported as
    /// `PreconditionFailed`.
    pub async fn bind(path: impl Into<PathBuf>, mode: u32) -> Result<Self> {
        let path = path.into();

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        if tokio::fs::try_exists(&path).await? {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(Error::PreconditionFailed(format!(
                    "{} is in use by another process",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "Removing stale socket");
            tokio::fs::remove_file(&path).await?;
        }

        let listener = UnixListener::bind(&path)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
        info!(path = %path.display(), mode = %format!("{mode:o}"), "Listening");

        Ok(Self {
            path,
            listener: Some(listener),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream of accepted connections, for `serve_with_incoming*`.
    ///
    /// The socket file stays owned by `self`; it is removed when `self` drops.
    pub fn incoming(&mut self) -> io::Result<UnixListenerStream> {
        self.listener
            .take()
            .map(UnixListenerStream::new)
            .ok_or_else(|| io::Error::other("listener already taken"))
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket"),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_sets_mode_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/kettle.sock");

        let socket = BoundSocket::bind(&path, 0o600).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(socket);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kettle.sock");
        // Bound then dropped without cleanup: a file nobody listens on.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let mut socket = BoundSocket::bind(&path, 0o666).await.unwrap();
        let mut incoming = socket.incoming().unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move { UnixStream::connect(path).await }
        });
        let accepted = tokio_stream::StreamExt::next(&mut incoming).await;
        assert!(matches!(accepted, Some(Ok(_))));
        assert!(client.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kettle.sock");
        let _first = BoundSocket::bind(&path, 0o666).await.unwrap();

        let err = BoundSocket::bind(&path, 0o666).await.unwrap_err();

        assert!(matches!(err, Error::PreconditionFailed(_)));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_incoming_taken_once() {
        let dir = TempDir::new().unwrap();
        let mut socket = BoundSocket::bind(dir.path().join("kettle.sock"), 0o666)
            .await
            .unwrap();

        assert!(socket.incoming().is_ok());
        assert!(socket.incoming().is_err());
    }
}

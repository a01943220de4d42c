//! Owned driver child process.

use crate::error::DriverError;
use crate::meta::DriverMeta;
use plexus_wire::MessageWriter;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;

/// Grace period between closing stdin and force-killing the child.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// The spawned child process behind a driver runtime.
///
/// Owns the process handle and its locked stdin writer. Output streams
/// are handed to the runtime at spawn time; the runtime turns them into
/// its inbound message channel and the stderr log forwarder.
pub struct DriverHandler {
    meta: DriverMeta,
    stdin: MessageWriter,
    child: Mutex<Option<Child>>,
}

impl DriverHandler {
    /// Spawns the driver executable with piped stdio.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Spawn`] when the executable cannot be
    /// started or its pipes cannot be established.
    pub fn spawn(meta: DriverMeta) -> Result<(Self, ChildStdout, ChildStderr), DriverError> {
        let spawn_err = |msg: &str| DriverError::Spawn {
            name: meta.name.clone(),
            source: std::io::Error::other(msg.to_string()),
        };

        let mut child = Command::new(&meta.executable)
            .args(&meta.arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                name: meta.name.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| spawn_err("no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("no stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("no stderr pipe"))?;

        Ok((
            Self {
                meta,
                stdin: MessageWriter::new(stdin),
                child: Mutex::new(Some(child)),
            },
            stdout,
            stderr,
        ))
    }

    /// Returns the driver descriptor this process was launched from.
    #[must_use]
    pub fn meta(&self) -> &DriverMeta {
        &self.meta
    }

    /// Returns the locked stdin writer.
    #[must_use]
    pub fn stdin(&self) -> &MessageWriter {
        &self.stdin
    }

    /// Waits for the child to exit and reaps it.
    ///
    /// Returns `None` when the child has already been reaped by an
    /// earlier `wait` or `close`.
    pub async fn wait(&self) -> Option<std::process::ExitStatus> {
        let child = self.child.lock().await.take();
        match child {
            Some(mut child) => child.wait().await.ok(),
            None => None,
        }
    }

    /// Closes the driver: shuts stdin, then gives the child a short
    /// grace period before killing it.
    ///
    /// Safe to call multiple times, and safe to call while another
    /// task is blocked in [`wait`](Self::wait): whichever takes the
    /// process handle first reaps it, and stdin EOF makes a
    /// well-behaved driver exit on its own.
    pub async fn close(&self) {
        self.stdin.close().await;

        let taken = self.child.lock().await.take();
        if let Some(mut child) = taken {
            if tokio::time::timeout(CLOSE_GRACE, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

impl std::fmt::Debug for DriverHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandler")
            .field("driver", &self.meta.name)
            .finish_non_exhaustive()
    }
}

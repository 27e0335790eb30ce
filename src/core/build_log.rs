//! Append-only per-build log sink.
//!
//! One log file per build, keyed by commit id. Spawned build tools stream
//! stdout and stderr into it concurrently, so the handle is cheaply
//! cloneable and writes are serialized internally. Closing is explicit:
//! the engine closes the sink when the chain finishes or halts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncWriteExt};
use tokio::sync::Mutex;

/// Shared handle to a build's log file
#[derive(Clone)]
pub struct BuildLog {
    path: PathBuf,
    inner: Arc<Mutex<Option<File>>>,
}

impl BuildLog {
    /// Truncate-open the log file, creating parent directories as needed
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The banner line written between steps
    pub fn banner(title: &str) -> String {
        format!("\r\n=============={}===========\r\n", title)
    }

    /// Write a step banner
    pub async fn section(&self, title: &str) -> io::Result<()> {
        self.write(Self::banner(title).as_bytes()).await
    }

    /// Append raw bytes
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(file) => file.write_all(bytes).await,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "build log is closed",
            )),
        }
    }

    /// Append a line of text
    pub async fn write_line(&self, text: &str) -> io::Result<()> {
        self.write(format!("{}\n", text).as_bytes()).await
    }

    /// Flush and close the log; later writes fail
    pub async fn close(&self) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Whether the sink has been closed
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

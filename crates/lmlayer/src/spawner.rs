//! Worker spawn strategies.
//!
//! A spawner hands back the host end of a message channel with a worker
//! already running behind it. The worker is either a tokio task in this
//! process or a `lmlayer-worker` subprocess speaking framed JSON on stdio.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::channel::{HostPort, Outbox, channel};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Incoming, Message};
use crate::model::ModelLoader;
use crate::worker::run_worker;

/// Default executable run by [`ProcessSpawner`].
pub const DEFAULT_WORKER_PROGRAM: &str = "lmlayer-worker";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<HostPort, SpawnError>;
}

/// Runs the worker as a task on the current runtime.
pub struct InProcessSpawner {
    loader: Arc<dyn ModelLoader>,
}

impl InProcessSpawner {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self { loader }
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self) -> Result<HostPort, SpawnError> {
        let (host, worker) = channel();
        let loader = Arc::clone(&self.loader);
        tokio::spawn(async move {
            match run_worker(loader, worker).await {
                Ok(()) => tracing::debug!("In-process worker finished"),
                Err(e) => tracing::error!(error = %e, "In-process worker failed"),
            }
        });
        Ok(host)
    }
}

/// Runs `lmlayer-worker` (or another compatible program) as a subprocess.
pub struct ProcessSpawner {
    program: OsString,
    args: Vec<OsString>,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_PROGRAM)
    }
}

impl ProcessSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<HostPort, SpawnError> {
        tracing::info!(program = ?self.program, "Spawning worker subprocess");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        let (outbound, mut requests) = mpsc::unbounded_channel::<Message>();
        let (outbox, inbound) = Outbox::channel();

        let mut writer = FramedWrite::new(stdin, JsonCodec::<Message>::new());
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                if let Err(e) = writer.send(message).await {
                    tracing::error!(error = %e, "Failed to write to worker");
                    return;
                }
            }
            // Host hung up; closing stdin tells the worker to exit.
            let _ = writer.close().await;
        });

        let mut reader = FramedRead::new(stdout, JsonCodec::<Incoming>::new());
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(incoming) => {
                        if outbox.forward(incoming).is_err() {
                            tracing::debug!("Host gone, dropping worker output");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to decode worker message");
                        return;
                    }
                }
            }
            tracing::debug!("Worker stdout closed");
        });

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => tracing::info!("Worker exited"),
                Ok(status) => tracing::warn!(%status, "Worker exited with failure"),
                Err(e) => tracing::error!(error = %e, "Failed to wait for worker"),
            }
        });

        Ok(HostPort { outbound, inbound })
    }
}

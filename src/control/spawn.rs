//! Worker spawning.
//!
//! A spawner produces a connected byte pipe with a control worker already
//! serving the far end. [`ThreadSpawner`] runs the worker in-process;
//! [`ProcessSpawner`] re-executes a binary's `worker` subcommand with its
//! end of the socket pair as stdin.

use std::ffi::OsString;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use super::worker::ControlWorker;
use crate::bridge::Bridge;
use crate::config::Config;
use crate::runtime::Runtime;

/// Something that can start a control worker.
pub trait WorkerSpawner {
    /// Start a worker; returns the consumer end of its pipe.
    fn spawn(&self) -> Result<(UnixStream, WorkerHandle)>;
}

/// A running worker, reaped with [`WorkerHandle::wait`].
#[derive(Debug)]
pub enum WorkerHandle {
    /// In-process worker thread.
    Thread(JoinHandle<Result<()>>),
    /// Child process.
    Process(Child),
}

impl WorkerHandle {
    /// Wait for the worker to exit.
    pub fn wait(self) -> Result<()> {
        match self {
            Self::Thread(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker thread panicked"))?,
            Self::Process(mut child) => {
                let status = child.wait().context("wait for worker process")?;
                if !status.success() {
                    anyhow::bail!("worker process exited with {status}");
                }
                Ok(())
            }
        }
    }

    /// Stop the worker without waiting for a clean exit.
    pub fn kill(self) {
        if let Self::Process(mut child) = self {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

// ─── In-process ────────────────────────────────────────────────────────────

/// Runs each worker on its own thread with a fresh bridge over `runtime`.
#[derive(Debug, Clone)]
pub struct ThreadSpawner<R> {
    runtime: R,
    config: Option<Config>,
}

impl<R: Runtime + Clone> ThreadSpawner<R> {
    /// Spawner whose workers drive clones of `runtime`.
    #[must_use]
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            config: None,
        }
    }

    /// Apply `config` to every server the workers create.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }
}

impl<R: Runtime + Clone> WorkerSpawner for ThreadSpawner<R> {
    fn spawn(&self) -> Result<(UnixStream, WorkerHandle)> {
        let (ours, theirs) = UnixStream::pair().context("control socket pair")?;
        let mut worker = ControlWorker::new(Bridge::with_runtime(self.runtime.clone()));
        if let Some(config) = self.config.clone() {
            worker = worker.with_config(config);
        }
        let handle = thread::Builder::new()
            .name("tsnet-control-worker".to_owned())
            .spawn(move || worker.serve(theirs))
            .context("spawn control worker thread")?;
        Ok((ours, WorkerHandle::Thread(handle)))
    }
}

// ─── Child process ─────────────────────────────────────────────────────────

/// Runs each worker as a child process speaking the protocol on stdin.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    /// Spawner that runs `program worker`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from("worker")],
            envs: Vec::new(),
        }
    }

    /// Spawner that re-executes the current binary.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("locate current executable")?;
        Ok(Self::new(exe))
    }

    /// Set an environment variable for the worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<(UnixStream, WorkerHandle)> {
        let (ours, theirs) = UnixStream::pair().context("control socket pair")?;
        // stdout stays closed to the protocol; the worker logs to stderr.
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn worker {}", self.program.display()))?;
        log::debug!("[control] spawned worker pid {}", child.id());
        Ok((ours, WorkerHandle::Process(child)))
    }
}

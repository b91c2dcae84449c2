//! Line-framed pipe transport.
//!
//! [`PipeTransport`] is the immutable recipe (descriptor, dispatcher,
//! tuning); [`PipeProcess`] is one running worker speaking the line
//! protocol of [`crate::ipc::frame`] over its stdin/stdout.
//!
//! Each running worker owns two background tasks:
//! - a reaper holding the `Child`, which force-kills it when the kill token
//!   fires and publishes the exit status on a watch channel
//! - a stderr drain appending everything the worker writes to stderr into
//!   an in-memory buffer

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ipc::frame::{self, Frame, LineRead};
use crate::ipc::oom::{ExitCodeOom, OomPredicate};
use crate::ipc::process::{
    CommandDispatcher, DataListener, ExitInfo, ExitReport, ProcessBoundary, Spawn,
};
use crate::sync::CallContext;
use crate::types::{Error, InstanceId, ProcessDescriptor, Result, TransportConfig};

/// Log target for worker output nobody is listening to.
pub const WORKER_LOG_TARGET: &str = "jitsu_ipc::worker";

type ExitOutcome = std::result::Result<ExitInfo, String>;

/// Recipe for starting line-framed workers.
#[derive(Debug, Clone)]
pub struct PipeTransport {
    descriptor: Arc<ProcessDescriptor>,
    dispatcher: Arc<dyn CommandDispatcher>,
    config: Arc<TransportConfig>,
    oom: Arc<dyn OomPredicate>,
}

impl PipeTransport {
    pub fn new(descriptor: ProcessDescriptor, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            dispatcher,
            config: Arc::new(TransportConfig::default()),
            oom: Arc::new(ExitCodeOom::default()),
        }
    }

    /// Replace the tuning. Also resets the OOM predicate to the configured
    /// exit-code heuristic.
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.oom = Arc::new(ExitCodeOom::new(&config.oom));
        self.config = Arc::new(config);
        self
    }

    pub fn with_oom_predicate(mut self, oom: Arc<dyn OomPredicate>) -> Self {
        self.oom = oom;
        self
    }

    pub fn descriptor(&self) -> &ProcessDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn command_name(&self) -> String {
        self.descriptor.command.display().to_string()
    }

    /// Start one worker. Nothing is left running on failure.
    pub async fn start(&self) -> Result<PipeProcess> {
        let descriptor = &self.descriptor;
        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            command: self.command_name(),
            source,
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            // Dropping the child with kill_on_drop tears the process down.
            return Err(Error::Spawn {
                command: self.command_name(),
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "worker stdio pipes unavailable",
                ),
            });
        };

        let id = InstanceId::new();
        let pid = child.id();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(reap(child, kill.clone(), exit_tx));
        let stderr_task = tokio::spawn(drain_stderr(stderr, stderr_buf.clone()));

        let process = PipeProcess {
            transport: self.clone(),
            id,
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(BufReader::new(stdout))),
            stderr: stderr_buf,
            stderr_task: Mutex::new(Some(stderr_task)),
            kill,
            exit: exit_rx,
        };
        tracing::debug!(worker = %process.describe(), "worker started");
        Ok(process)
    }
}

#[async_trait]
impl Spawn for PipeTransport {
    async fn spawn(&self) -> Result<Arc<dyn ProcessBoundary>> {
        Ok(Arc::new(self.start().await?))
    }
}

/// Own the child until it exits; kill it when asked.
async fn reap(
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "start_kill failed, worker already gone");
            }
            child.wait().await
        }
    };
    let outcome = status
        .map(ExitInfo::from_status)
        .map_err(|e| e.to_string());
    // No receivers left means the process handle was dropped.
    let _ = exit_tx.send(Some(outcome));
}

async fn drain_stderr(mut stderr: ChildStderr, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "worker stderr read failed");
                break;
            }
        }
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitOutcome>>) -> Result<ExitInfo> {
    let outcome = exit
        .wait_for(Option::is_some)
        .await
        .map_err(|_| Error::internal("worker reaper stopped without an exit status"))?;
    match &*outcome {
        Some(Ok(info)) => Ok(*info),
        Some(Err(msg)) => Err(Error::internal(format!("wait for worker: {msg}"))),
        None => Err(Error::internal("worker exit status missing")),
    }
}

enum Step {
    Cancelled(Error),
    Read(std::io::Result<LineRead>),
}

/// One running worker. Dropping it kills the process.
#[derive(Debug)]
pub struct PipeProcess {
    transport: PipeTransport,
    id: InstanceId,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl PipeProcess {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Answer a host-callback frame. Dispatcher failures are logged only.
    async fn host_callback(&self, ctx: &CallContext, command: &str, payload: &[u8]) -> Result<()> {
        let response = match self.transport.dispatcher.dispatch(command, payload).await {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::error!(
                    worker = %self.describe(),
                    command,
                    error = %err,
                    "host callback failed"
                );
                return Ok(());
            }
        };
        let encoded = frame::encode_host_response(command, &response)?;
        self.send(ctx, &encoded).await
    }

    async fn close_streams(&self) {
        self.stdin.lock().await.take();
        self.stdout.lock().await.take();
    }

    async fn collect_stderr(&self) -> String {
        let task = self.stderr_task.lock().await.take();
        if let Some(mut task) = task {
            let drain = self.transport.config.stderr_drain;
            if tokio::time::timeout(drain, &mut task).await.is_err() {
                tracing::debug!(worker = %self.describe(), "stderr still open after exit, truncating");
                task.abort();
            }
        }
        let buf = self.stderr.lock().await;
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[async_trait]
impl Spawn for PipeProcess {
    async fn spawn(&self) -> Result<Arc<dyn ProcessBoundary>> {
        self.transport.spawn().await
    }
}

#[async_trait]
impl ProcessBoundary for PipeProcess {
    async fn send(&self, ctx: &CallContext, payload: &[u8]) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(Error::stream_closed("stdin already closed"));
        };
        tokio::select! {
            biased;
            err = ctx.done() => {
                // A half-written line would corrupt the framing.
                self.kill();
                Err(Error::stream_closed(format!("worker killed: {err}")))
            }
            written = frame::write_line(writer, payload) => written.map_err(Error::from),
        }
    }

    async fn receive(
        &self,
        ctx: &CallContext,
        listener: Option<&dyn DataListener>,
    ) -> Result<Bytes> {
        let max_line_bytes = self.transport.config.max_line_bytes;
        let mut stdout = self.stdout.lock().await;
        let mut line = Vec::new();

        loop {
            line.clear();
            let Some(reader) = stdout.as_mut() else {
                return Err(Error::stream_closed("stdout already closed"));
            };
            let step = tokio::select! {
                biased;
                err = ctx.done() => Step::Cancelled(err),
                read = frame::read_line(reader, &mut line, max_line_bytes) => Step::Read(read),
            };

            match step {
                Step::Cancelled(err) => {
                    tracing::debug!(worker = %self.describe(), "exchange cancelled, killing worker");
                    self.kill();
                    stdout.take();
                    return Err(Error::stream_closed(format!("worker killed: {err}")));
                }
                Step::Read(Err(e)) => return Err(e.into()),
                Step::Read(Ok(LineRead::Eof)) => return Err(Error::stream_closed("EOF")),
                Step::Read(Ok(LineRead::TooLong)) => {
                    self.kill();
                    stdout.take();
                    return Err(Error::protocol(format!(
                        "worker line exceeds {} bytes",
                        max_line_bytes
                    )));
                }
                Step::Read(Ok(LineRead::Line(_))) => {}
            }

            let parsed = frame::parse_line(&line);
            match parsed {
                Frame::Control { payload, .. } if parsed.is_result() => {
                    return Ok(Bytes::copy_from_slice(payload));
                }
                Frame::Control { command, payload } => {
                    self.host_callback(ctx, &command, payload).await?;
                }
                Frame::Data(data) => match listener {
                    Some(listener) => listener.on_data(data),
                    None => tracing::info!(
                        target: WORKER_LOG_TARGET,
                        worker = %self.describe(),
                        "{}",
                        String::from_utf8_lossy(data)
                    ),
                },
                Frame::Empty => {}
            }
        }
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("{} [pid={} id={}]", self.transport.command_name(), pid, self.id),
            None => format!("{} [id={}]", self.transport.command_name(), self.id),
        }
    }

    fn kill(&self) {
        self.kill.cancel();
    }

    async fn wait(&self) -> Result<ExitReport> {
        let ceiling = self.transport.config.wait_ceiling;
        let mut exit = self.exit.clone();
        let waited = tokio::time::timeout(ceiling, wait_for_exit(&mut exit)).await;
        let exit_info = match waited {
            Ok(exit_info) => exit_info,
            Err(_) => {
                tracing::warn!(
                    worker = %self.describe(),
                    ceiling = ?ceiling,
                    "worker did not exit in time, killing"
                );
                self.kill();
                wait_for_exit(&mut exit).await
            }
        }?;

        self.close_streams().await;
        let stderr = self.collect_stderr().await;

        if self.transport.oom.is_oom(&exit_info, &stderr) {
            tracing::warn!(worker = %self.describe(), exit = %exit_info, "worker ran out of memory");
            return Err(Error::OutOfMemory {
                code: exit_info.code,
                stderr,
            });
        }

        if exit_info.success() {
            if !stderr.trim().is_empty() {
                tracing::warn!(
                    worker = %self.describe(),
                    stderr = %stderr.trim(),
                    "worker exited cleanly but wrote to stderr"
                );
            }
        } else {
            tracing::debug!(worker = %self.describe(), exit = %exit_info, "worker exited");
        }

        Ok(ExitReport {
            exit: exit_info,
            stderr,
            killed: self.kill.is_cancelled(),
        })
    }
}

impl Drop for PipeProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

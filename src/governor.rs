//! Worker governor - single-flight exchanges with transparent respawn.
//!
//! The governor owns the live [`ProcessBoundary`] and funnels every exchange
//! through a [`CancellableMutex`], so at most one conversation touches the
//! worker's pipes at a time. A round trip that fails because the worker died
//! is retried against a freshly spawned worker unless the governor runs in
//! standalone mode or has been closed.
//!
//! ```text
//!   exchange ─► lock ─► send/receive ─► ok ─────────────────────► response
//!                           │
//!                           └─ stream gone ─► wait ─► standalone? ─► error
//!                                                 └─► respawn, swap, retry
//! ```

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::ipc::classify::is_stream_gone;
use crate::ipc::process::{DataListener, ExitReport, ProcessBoundary, Spawn};
use crate::sync::{CallContext, CancellableMutex};
use crate::types::{Error, GovernorConfig, Result};

/// Supervisor for one worker process.
#[derive(Debug)]
pub struct Governor {
    live: RwLock<Arc<dyn ProcessBoundary>>,
    lock: CancellableMutex,
    standalone: bool,
    max_respawns: u32,
    closed: AtomicBool,
    restarts: AtomicU64,
}

impl Governor {
    /// Spawn the first worker. Fails if it cannot be started.
    pub async fn start(spawner: &dyn Spawn, standalone: bool) -> Result<Self> {
        let config = GovernorConfig {
            standalone,
            ..GovernorConfig::default()
        };
        Self::from_config(spawner, &config).await
    }

    /// Spawn the first worker with the supervision settings of `config`.
    /// The worker itself comes from `spawner`, not `config.worker`.
    pub async fn from_config(spawner: &dyn Spawn, config: &GovernorConfig) -> Result<Self> {
        let process = spawner.spawn().await?;
        tracing::info!(
            worker = %process.describe(),
            standalone = config.standalone,
            max_respawns = config.max_respawns_per_exchange,
            "governor started"
        );
        Ok(Self {
            live: RwLock::new(process),
            lock: CancellableMutex::new(),
            standalone: config.standalone,
            max_respawns: config.max_respawns_per_exchange,
            closed: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        })
    }

    /// Send `payload` and return the worker's result, respawning a dead
    /// worker and retrying the same payload when allowed.
    ///
    /// Outside standalone mode a dead worker is always replaced before an
    /// error is returned, so a failed exchange never poisons the next one.
    pub async fn exchange(
        &self,
        ctx: &CallContext,
        payload: &[u8],
        listener: Option<&dyn DataListener>,
    ) -> Result<Bytes> {
        let _guard = self.lock.acquire(ctx).await?;
        let mut retries = 0u32;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if self.is_closed() {
                return Err(Error::GovernorClosed);
            }

            let process = self.current().await;
            let err = match round_trip(process.as_ref(), ctx, payload, listener).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if self.is_closed() {
                return Err(Error::GovernorClosed);
            }
            if !is_stream_gone(&err) {
                return Err(err);
            }

            tracing::debug!(worker = %process.describe(), error = %err, "worker stream gone");
            let report = match process.wait().await {
                Ok(report) => report,
                Err(err) => {
                    if !self.standalone {
                        self.respawn(process.as_ref(), &err).await?;
                    }
                    return Err(err);
                }
            };

            if self.standalone {
                return Err(standalone_exit(report));
            }

            self.respawn(process.as_ref(), &report.exit).await?;
            if retries >= self.max_respawns {
                tracing::warn!(
                    worker = %process.describe(),
                    deaths = retries + 1,
                    "worker keeps dying on the same payload, giving up"
                );
                return Err(crash_loop_exit(report, retries + 1));
            }
            retries += 1;
        }
    }

    /// One send/receive attempt under the lock, without failure
    /// classification or respawn.
    pub async fn exchange_direct(
        &self,
        ctx: &CallContext,
        payload: &[u8],
        listener: Option<&dyn DataListener>,
    ) -> Result<Bytes> {
        let _guard = self.lock.acquire(ctx).await?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.is_closed() {
            return Err(Error::GovernorClosed);
        }
        let process = self.current().await;
        round_trip(process.as_ref(), ctx, payload, listener).await
    }

    /// Stop serving: fail all waiting and future exchanges and kill the
    /// live worker. Safe to call more than once.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("governor closing");
        }
        self.lock.close();
        self.live.read().await.kill();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// Number of workers spawned to replace dead ones.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Identity of the live worker.
    pub async fn describe(&self) -> String {
        self.live.read().await.describe()
    }

    async fn current(&self) -> Arc<dyn ProcessBoundary> {
        self.live.read().await.clone()
    }

    /// Start a replacement for `dead` and make it the live worker. `cause`
    /// is only logged.
    ///
    /// The closed flag is re-checked under the write lock so a concurrent
    /// `close` either sees the replacement and kills it, or the replacement
    /// is discarded here.
    async fn respawn(&self, dead: &dyn ProcessBoundary, cause: &(dyn fmt::Display + Sync)) -> Result<()> {
        if self.is_closed() {
            return Err(Error::GovernorClosed);
        }
        let next = dead.spawn().await.map_err(Error::respawn)?;

        let mut live = self.live.write().await;
        if self.is_closed() {
            next.kill();
            return Err(Error::GovernorClosed);
        }
        tracing::info!(
            dead = %dead.describe(),
            cause = %cause,
            worker = %next.describe(),
            "worker died, respawned"
        );
        *live = next;
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn round_trip(
    process: &dyn ProcessBoundary,
    ctx: &CallContext,
    payload: &[u8],
    listener: Option<&dyn DataListener>,
) -> Result<Bytes> {
    process.send(ctx, payload).await?;
    process.receive(ctx, listener).await
}

fn crash_loop_exit(report: ExitReport, deaths: u32) -> Error {
    Error::ProcessExited {
        reason: format!("worker died {deaths} times on one payload ({})", report.exit),
        stderr: report.stderr,
    }
}

fn standalone_exit(report: ExitReport) -> Error {
    let reason = if report.killed {
        format!("worker closed by caller ({})", report.exit)
    } else {
        format!("worker exited on its own ({})", report.exit)
    };
    Error::ProcessExited {
        reason,
        stderr: report.stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::process::ExitInfo;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted worker: each call to `receive` pops the next outcome.
    #[derive(Debug)]
    struct FakeWorker {
        generation: usize,
        script: Arc<FakeScript>,
        killed: AtomicBool,
    }

    #[derive(Debug, Default)]
    struct FakeScript {
        receives: StdMutex<VecDeque<Result<Bytes>>>,
        sent: StdMutex<Vec<(usize, Vec<u8>)>>,
        spawned: AtomicU64,
        fail_spawn_after: Option<u64>,
        oom_generation: Option<usize>,
        stderr: String,
    }

    impl FakeScript {
        fn with(receives: Vec<Result<Bytes>>) -> Arc<Self> {
            Arc::new(Self {
                receives: StdMutex::new(receives.into()),
                stderr: "worker stderr".to_string(),
                ..Self::default()
            })
        }
    }

    #[derive(Debug)]
    struct FakeSpawner(Arc<FakeScript>);

    #[async_trait]
    impl Spawn for FakeSpawner {
        async fn spawn(&self) -> Result<Arc<dyn ProcessBoundary>> {
            spawn_fake(&self.0)
        }
    }

    fn spawn_fake(script: &Arc<FakeScript>) -> Result<Arc<dyn ProcessBoundary>> {
        let generation = script.spawned.fetch_add(1, Ordering::SeqCst) as usize;
        if let Some(limit) = script.fail_spawn_after {
            if generation as u64 >= limit {
                return Err(Error::Spawn {
                    command: "fake".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
        }
        Ok(Arc::new(FakeWorker {
            generation,
            script: script.clone(),
            killed: AtomicBool::new(false),
        }))
    }

    #[async_trait]
    impl Spawn for FakeWorker {
        async fn spawn(&self) -> Result<Arc<dyn ProcessBoundary>> {
            spawn_fake(&self.script)
        }
    }

    #[async_trait]
    impl ProcessBoundary for FakeWorker {
        async fn send(&self, _ctx: &CallContext, payload: &[u8]) -> Result<()> {
            if self.killed.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)));
            }
            self.script
                .sent
                .lock()
                .unwrap()
                .push((self.generation, payload.to_vec()));
            Ok(())
        }

        async fn receive(
            &self,
            _ctx: &CallContext,
            listener: Option<&dyn DataListener>,
        ) -> Result<Bytes> {
            if let Some(listener) = listener {
                listener.on_data(b"progress");
            }
            self.script
                .receives
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::stream_closed("EOF")))
        }

        fn describe(&self) -> String {
            format!("fake#{}", self.generation)
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }

        async fn wait(&self) -> Result<ExitReport> {
            if self.script.oom_generation == Some(self.generation) {
                return Err(Error::OutOfMemory {
                    code: Some(137),
                    stderr: String::new(),
                });
            }
            Ok(ExitReport {
                exit: ExitInfo { code: Some(1), signal: None },
                stderr: self.script.stderr.clone(),
                killed: self.killed.load(Ordering::SeqCst),
            })
        }
    }

    fn ok(body: &'static str) -> Result<Bytes> {
        Ok(Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_exchange_success() {
        let script = FakeScript::with(vec![ok("pong")]);
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let response = governor.exchange(&CallContext::new(), b"ping", None).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"pong"));
        assert_eq!(governor.restarts(), 0);
        assert_eq!(governor.describe().await, "fake#0");
    }

    #[tokio::test]
    async fn test_exchange_respawns_and_retries_same_payload() {
        let script = FakeScript::with(vec![Err(Error::stream_closed("EOF")), ok("pong")]);
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let response = governor.exchange(&CallContext::new(), b"ping", None).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"pong"));
        assert_eq!(governor.restarts(), 1);
        assert_eq!(governor.describe().await, "fake#1");

        let sent = script.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(0, b"ping".to_vec()), (1, b"ping".to_vec())]);
    }

    #[tokio::test]
    async fn test_standalone_death_is_terminal() {
        let script = FakeScript::with(vec![Err(Error::stream_closed("EOF"))]);
        let governor = Governor::start(&FakeSpawner(script.clone()), true).await.unwrap();

        let err = governor.exchange(&CallContext::new(), b"ping", None).await.unwrap_err();
        match err {
            Error::ProcessExited { reason, stderr } => {
                assert!(reason.contains("exited on its own"));
                assert_eq!(stderr, "worker stderr");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(script.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_recoverable_error_is_returned_as_is() {
        let script = FakeScript::with(vec![Err(Error::protocol("garbage"))]);
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let err = governor.exchange(&CallContext::new(), b"ping", None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(script.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_respawn_failure_is_wrapped_and_not_retried() {
        let script = Arc::new(FakeScript {
            receives: StdMutex::new(vec![Err(Error::stream_closed("EOF"))].into()),
            fail_spawn_after: Some(1),
            ..FakeScript::default()
        });
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let err = governor.exchange(&CallContext::new(), b"ping", None).await.unwrap_err();
        assert!(matches!(err, Error::Respawn(_)));
        assert_eq!(script.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_out_of_memory_replaces_worker() {
        let script = Arc::new(FakeScript {
            receives: StdMutex::new(vec![Err(Error::stream_closed("EOF")), ok("pong")].into()),
            oom_generation: Some(0),
            ..FakeScript::default()
        });
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let err = governor.exchange(&CallContext::new(), b"big", None).await.unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(governor.restarts(), 1);
        assert_eq!(governor.describe().await, "fake#1");

        let response = governor.exchange(&CallContext::new(), b"small", None).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"pong"));
        let sent = script.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(0, b"big".to_vec()), (1, b"small".to_vec())]);
    }

    #[tokio::test]
    async fn test_out_of_memory_respawn_failure_is_wrapped() {
        let script = Arc::new(FakeScript {
            receives: StdMutex::new(vec![Err(Error::stream_closed("EOF"))].into()),
            oom_generation: Some(0),
            fail_spawn_after: Some(1),
            ..FakeScript::default()
        });
        let governor = Governor::start(&FakeSpawner(script), false).await.unwrap();

        let err = governor.exchange(&CallContext::new(), b"big", None).await.unwrap_err();
        assert!(matches!(err, Error::Respawn(_)));
        assert_eq!(governor.restarts(), 0);
    }

    #[tokio::test]
    async fn test_standalone_out_of_memory_does_not_respawn() {
        let script = Arc::new(FakeScript {
            receives: StdMutex::new(vec![Err(Error::stream_closed("EOF"))].into()),
            oom_generation: Some(0),
            ..FakeScript::default()
        });
        let governor = Governor::start(&FakeSpawner(script.clone()), true).await.unwrap();

        let err = governor.exchange(&CallContext::new(), b"big", None).await.unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(script.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_crash_loop_is_bounded() {
        // Every receive fails: each replacement dies on the same payload.
        let script = FakeScript::with(Vec::new());
        let config = GovernorConfig {
            max_respawns_per_exchange: 2,
            ..GovernorConfig::default()
        };
        let governor = Governor::from_config(&FakeSpawner(script.clone()), &config)
            .await
            .unwrap();

        let err = governor.exchange(&CallContext::new(), b"poison", None).await.unwrap_err();
        match err {
            Error::ProcessExited { reason, stderr } => {
                assert!(reason.contains("3 times"), "{reason}");
                assert_eq!(stderr, "worker stderr");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(governor.restarts(), 3);
        assert_eq!(script.spawned.load(Ordering::SeqCst), 4);
        assert_eq!(script.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let script = Arc::new(FakeScript {
            fail_spawn_after: Some(0),
            ..FakeScript::default()
        });
        let err = Governor::start(&FakeSpawner(script), false).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_close_fails_future_exchanges() {
        let script = FakeScript::with(vec![ok("pong"), ok("pong")]);
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        governor.close().await;
        governor.close().await;
        assert!(governor.is_closed());

        let err = governor.exchange(&CallContext::new(), b"ping", None).await.unwrap_err();
        assert!(err.is_closed());
        let err = governor
            .exchange_direct(&CallContext::new(), b"ping", None)
            .await
            .unwrap_err();
        assert!(err.is_closed());
        assert_eq!(script.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_before_sending() {
        let script = FakeScript::with(vec![ok("pong")]);
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let ctx = CallContext::new();
        ctx.cancel();
        let err = governor.exchange(&ctx, b"ping", None).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(script.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_direct_does_not_respawn() {
        let script = FakeScript::with(vec![Err(Error::stream_closed("EOF")), ok("pong")]);
        let governor = Governor::start(&FakeSpawner(script.clone()), false).await.unwrap();

        let err = governor
            .exchange_direct(&CallContext::new(), b"probe", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StreamClosed(_)));
        assert_eq!(governor.restarts(), 0);
    }

    #[tokio::test]
    async fn test_listener_receives_data() {
        let script = FakeScript::with(vec![ok("pong")]);
        let governor = Governor::start(&FakeSpawner(script), false).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();

        governor
            .exchange(&CallContext::new(), b"ping", Some(&tx))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"progress"));
    }

    #[tokio::test]
    async fn test_waiter_times_out_behind_holder() {
        let script = FakeScript::with(vec![ok("pong")]);
        let governor = Arc::new(Governor::start(&FakeSpawner(script), false).await.unwrap());

        let holder = governor.lock.acquire(&CallContext::new()).await.unwrap();
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = governor.exchange(&ctx, b"ping", None).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        drop(holder);
    }
}

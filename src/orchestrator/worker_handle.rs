//! Worker handle: owns one worker process's lifecycle.
//!
//! A handle moves through [`WorkerState`] exactly once. It never leaves
//! `Exited`; [`WorkerHandle::restart`] hands back a fresh handle instead of
//! reviving the dead one.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::ProcessChannel;
use crate::models::worker::{TenantDirs, WorkerExit, WorkerState};
use crate::orchestrator::child_monitor;
use crate::orchestrator::spawner::{self, SpawnConfig};
use crate::rpc::{RemoteHandle, RemoteRef, RpcTransport, TransportEvent};
use crate::{AppError, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// How long a lost channel waits for the process exit to be reported
/// before the handle records the channel loss itself.
const CHANNEL_LOSS_GRACE: Duration = Duration::from_millis(200);

type ExitListener = Box<dyn FnOnce(&WorkerExit) + Send>;
type StartFuture = Shared<BoxFuture<'static, Result<RemoteRef>>>;

/// Remote facades produced by the worker's `runEngine` bootstrap call.
#[derive(Debug, Clone)]
pub struct EngineFacades {
    /// Hosted engine.
    pub engine: RemoteHandle,
    /// Assistant attached to the engine.
    pub assistant: RemoteHandle,
}

#[derive(Deserialize)]
struct EngineRefs {
    engine: RemoteRef,
    assistant: RemoteRef,
}

struct Lifecycle {
    state: WorkerState,
    pid: Option<u32>,
    root: Option<RemoteRef>,
    transport: Option<RpcTransport>,
    exit: Option<WorkerExit>,
    listeners: Vec<ExitListener>,
}

struct HandleInner {
    id: u64,
    account_id: String,
    dirs: TenantDirs,
    spawn: SpawnConfig,
    start_delay: Duration,
    lifecycle: Mutex<Lifecycle>,
    start: Mutex<Option<StartFuture>>,
    usage_count: AtomicU32,
    kill: CancellationToken,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Nobody can observe the worker any more; take the process down with us.
        self.kill.cancel();
    }
}

/// Cheaply cloneable handle to one worker process.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.inner.id)
            .field("account_id", &self.inner.account_id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

/// Removes a channel socket file once the handshake no longer needs it.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.0.display(), %err, "failed to remove channel socket");
            }
        }
    }
}

impl WorkerHandle {
    /// Create a handle in the `Created` state. Nothing is spawned until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(account_id: impl Into<String>, dirs: TenantDirs, spawn: SpawnConfig) -> Self {
        Self::with_start_delay(account_id.into(), dirs, spawn, Duration::ZERO)
    }

    fn with_start_delay(
        account_id: String,
        dirs: TenantDirs,
        spawn: SpawnConfig,
        start_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                account_id,
                dirs,
                spawn,
                start_delay,
                lifecycle: Mutex::new(Lifecycle {
                    state: WorkerState::Created,
                    pid: None,
                    root: None,
                    transport: None,
                    exit: None,
                    listeners: Vec::new(),
                }),
                start: Mutex::new(None),
                usage_count: AtomicU32::new(0),
                kill: CancellationToken::new(),
            }),
        }
    }

    /// Process-unique identifier of this handle.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Account served by this worker.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    /// Worker's private working directory.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.inner.dirs.working_dir
    }

    /// Cache directory handed to the engine.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.inner.dirs.cache_dir
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.lifecycle().state
    }

    /// OS process id, once spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.lifecycle().pid
    }

    /// Root object reference announced in the `ready` message.
    #[must_use]
    pub fn root(&self) -> Option<RemoteRef> {
        self.lifecycle().root
    }

    /// How the worker exited, once it has.
    #[must_use]
    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.lifecycle().exit.clone()
    }

    /// Number of successful `runEngine` bootstraps. Advisory only.
    #[must_use]
    pub fn usage_count(&self) -> u32 {
        self.inner.usage_count.load(Ordering::Relaxed)
    }

    /// Spawn the worker and wait for its `ready` message.
    ///
    /// Concurrent and repeated calls share a single attempt and observe the
    /// same outcome.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if directories, the socket, or the process could
    ///   not be created.
    /// - `AppError::Handshake` if the worker exited, closed its channel, or
    ///   timed out before signalling `ready`.
    /// - `AppError::NotRunning` if the handle was killed before starting.
    pub async fn start(&self) -> Result<RemoteRef> {
        let attempt = {
            let mut slot = self
                .inner
                .start
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(attempt) = slot.as_ref() {
                attempt.clone()
            } else {
                let handle = self.clone();
                let span = info_span!("worker_start", account_id = %self.inner.account_id);
                let task = tokio::spawn(async move { handle.launch().await }.instrument(span));
                let attempt = async move {
                    task.await.unwrap_or_else(|err| {
                        Err(AppError::Spawn(format!("start task failed: {err}")))
                    })
                }
                .boxed()
                .shared();
                *slot = Some(attempt.clone());
                attempt
            }
        };
        attempt.await
    }

    /// Bootstrap the hosted engine and return its facades.
    ///
    /// # Errors
    ///
    /// - `AppError::NotRunning` unless the worker is `Ready`.
    /// - `AppError::Remote` / `AppError::Disconnected` from the remote call.
    pub async fn run_engine(&self) -> Result<EngineFacades> {
        let (transport, root) = self.ready_transport()?;
        let options = json!({
            "accountId": self.inner.account_id,
            "cacheDir": self.inner.dirs.cache_dir.to_string_lossy(),
        });

        let refs: EngineRefs = transport
            .handle(root)
            .call_as("runEngine", vec![options])
            .await?;
        let activations = self.inner.usage_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(account_id = %self.inner.account_id, activations, "engine bootstrapped");

        Ok(EngineFacades {
            engine: transport.handle(refs.engine),
            assistant: transport.handle(refs.assistant),
        })
    }

    /// Hand `handle` to the worker under `correlation_id`.
    ///
    /// # Errors
    ///
    /// - `AppError::NotRunning` unless the worker is `Ready`.
    /// - `AppError::ChannelClosed` / `AppError::Channel` from the transfer.
    pub async fn send_direct(&self, correlation_id: &str, handle: OwnedFd) -> Result<()> {
        let (transport, _) = self.ready_transport()?;
        transport.send_direct(correlation_id, handle).await
    }

    /// Terminate the worker.
    ///
    /// The handle is `Exited` and every exit listener has run by the time
    /// this returns; reaping the OS process happens in the background.
    pub fn kill(&self) {
        self.mark_exited(WorkerExit::killed());
    }

    /// Kill this worker (if still live) and return a fresh handle for the
    /// same account whose start begins after `delay`.
    ///
    /// The returned handle has not been started; call
    /// [`start`](Self::start) on it.
    #[must_use]
    pub fn restart(&self, delay: Duration) -> Self {
        if self.state().is_live() {
            self.kill();
        }
        info!(account_id = %self.inner.account_id, ?delay, "worker restart scheduled");
        self.successor(delay)
    }

    /// Fresh handle for the same account whose start begins after `delay`.
    /// This handle is left untouched.
    pub(crate) fn successor(&self, delay: Duration) -> Self {
        Self::with_start_delay(
            self.inner.account_id.clone(),
            self.inner.dirs.clone(),
            self.inner.spawn.clone(),
            delay,
        )
    }

    /// Register a listener for the worker's exit.
    ///
    /// Runs immediately if the worker has already exited; otherwise exactly
    /// once when it does.
    pub fn on_exit<F>(&self, listener: F)
    where
        F: FnOnce(&WorkerExit) + Send + 'static,
    {
        let exit = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.exit.clone() {
                Some(exit) => exit,
                None => {
                    lifecycle.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&exit);
    }

    async fn launch(self) -> Result<RemoteRef> {
        let delay = self.inner.start_delay;
        if !delay.is_zero() {
            tokio::select! {
                () = self.inner.kill.cancelled() => {
                    return Err(AppError::NotRunning(format!(
                        "worker for {} was killed before it started",
                        self.inner.account_id
                    )));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(WorkerState::Starting)?;

        match self.bring_up().await {
            Ok(root) => Ok(root),
            Err(err) => {
                warn!(account_id = %self.inner.account_id, %err, "worker failed to start");
                self.mark_exited(WorkerExit::failed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn bring_up(&self) -> Result<RemoteRef> {
        let inner = &self.inner;
        for dir in [
            &inner.dirs.working_dir,
            &inner.dirs.cache_dir,
            &inner.spawn.runtime_dir,
        ] {
            tokio::fs::create_dir_all(dir).await.map_err(|err| {
                AppError::Spawn(format!("failed to create {}: {err}", dir.display()))
            })?;
        }

        let socket_path = inner
            .spawn
            .runtime_dir
            .join(format!("{}.sock", Uuid::new_v4().simple()));
        let listener = UnixListener::bind(&socket_path).map_err(|err| {
            AppError::Spawn(format!(
                "failed to bind channel socket {}: {err}",
                socket_path.display()
            ))
        })?;
        let _socket_file = SocketFile(socket_path.clone());

        let child = spawner::spawn_worker(
            &inner.spawn,
            &inner.account_id,
            &inner.dirs.working_dir,
            &socket_path,
        )?;
        let pid = child.id();
        self.lifecycle().pid = pid;

        let weak = Arc::downgrade(&self.inner);
        let _monitor = child_monitor::monitor_exit(
            inner.account_id.clone(),
            child,
            inner.kill.clone(),
            move |exit| {
                if let Some(inner) = weak.upgrade() {
                    WorkerHandle { inner }.mark_exited(exit);
                }
            },
        );

        let handshake = async {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|err| AppError::Handshake(format!("channel accept failed: {err}")))?;
            let (channel, inbound) = ProcessChannel::open(&inner.account_id, stream);
            let (transport, mut events) = RpcTransport::new(channel, inbound);
            loop {
                match events.recv().await {
                    Some(TransportEvent::Ready(root)) => return Ok((transport, root)),
                    Some(TransportEvent::Direct { id, .. }) => {
                        debug!(account_id = %inner.account_id, id = %id, "ignoring direct message before ready");
                    }
                    None => {
                        return Err(AppError::Handshake("channel closed before ready".into()));
                    }
                }
            }
        };

        let timeout = inner.spawn.startup_timeout;
        let (transport, root) = tokio::select! {
            () = inner.kill.cancelled() => {
                let reason = self
                    .exit_status()
                    .map_or_else(|| "killed".to_owned(), |exit| exit.reason);
                return Err(AppError::Handshake(format!("worker exited before ready: {reason}")));
            }
            outcome = tokio::time::timeout(timeout, handshake) => match outcome {
                Ok(result) => result?,
                Err(_elapsed) => {
                    return Err(AppError::Handshake(format!(
                        "worker did not signal ready within {timeout:?}"
                    )));
                }
            },
        };

        let channel_closed = transport.closed();
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != WorkerState::Starting {
                drop(lifecycle);
                transport.close("worker exited during startup");
                return Err(AppError::Handshake("worker exited during startup".into()));
            }
            lifecycle.state = WorkerState::Ready;
            lifecycle.root = Some(root);
            lifecycle.transport = Some(transport);
        }
        self.watch_channel(channel_closed);

        info!(account_id = %inner.account_id, pid, root = root.id, "worker ready");
        Ok(root)
    }

    /// Exit the handle when its channel ends while the process lives on;
    /// a ready worker without a channel cannot serve its facades.
    fn watch_channel(&self, closed: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let kill = self.inner.kill.clone();
        let account_id = self.inner.account_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = kill.cancelled() => return,
                () = closed.cancelled() => {}
            }
            tokio::select! {
                () = kill.cancelled() => return,
                () = tokio::time::sleep(CHANNEL_LOSS_GRACE) => {}
            }
            if let Some(inner) = weak.upgrade() {
                warn!(account_id, "worker channel closed while the process is running");
                WorkerHandle { inner }.mark_exited(WorkerExit::failed("channel closed"));
            }
        });
    }

    fn transition(&self, next: WorkerState) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if !lifecycle.state.can_transition_to(next) {
            return Err(AppError::NotRunning(format!(
                "worker for {} cannot move from {:?} to {next:?}",
                self.inner.account_id, lifecycle.state
            )));
        }
        lifecycle.state = next;
        Ok(())
    }

    /// Record the exit once; later calls are ignored.
    fn mark_exited(&self, exit: WorkerExit) {
        let (listeners, transport) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == WorkerState::Exited {
                return;
            }
            lifecycle.state = WorkerState::Exited;
            lifecycle.root = None;
            lifecycle.exit = Some(exit.clone());
            (
                std::mem::take(&mut lifecycle.listeners),
                lifecycle.transport.take(),
            )
        };

        self.inner.kill.cancel();
        if let Some(transport) = transport {
            transport.close(&format!("worker exited: {}", exit.reason));
        }
        info!(
            account_id = %self.inner.account_id,
            handle_id = self.inner.id,
            code = ?exit.code,
            reason = %exit.reason,
            "worker marked exited"
        );

        for listener in listeners {
            listener(&exit);
        }
    }

    fn ready_transport(&self) -> Result<(RpcTransport, RemoteRef)> {
        let lifecycle = self.lifecycle();
        match (&lifecycle.transport, lifecycle.root) {
            (Some(transport), Some(root)) if lifecycle.state == WorkerState::Ready => {
                Ok((transport.clone(), root))
            }
            _ => Err(AppError::NotRunning(format!(
                "worker for {} is {:?}",
                self.inner.account_id, lifecycle.state
            ))),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

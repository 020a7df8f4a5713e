//! Worker-side runtime.
//!
//! Runs inside each `engine-worker` process: connects to the channel socket
//! named on the command line, exports a root object whose `runEngine`
//! method boots the tenant's engine, announces it with `ready`, and serves
//! calls until the supervisor closes the channel.

pub mod engine;

use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::channel::ProcessChannel;
use crate::orchestrator::spawner::ACCOUNT_ID_ENV;
use crate::rpc::{
    arg, unknown_method, CallContext, InvokeFuture, RemoteObject, RpcTransport, TransportEvent,
};
use crate::{AppError, Result};

/// Options passed by the supervisor to `runEngine`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    /// Tenant served by this worker.
    pub account_id: String,
    /// Directory the engine may use for caches.
    pub cache_dir: PathBuf,
}

/// Receives OS handles transferred with `direct` messages.
pub trait DirectSink: Send + Sync {
    /// Take ownership of `handle`, sent under `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be used; it is logged.
    fn accept(
        &self,
        correlation_id: String,
        handle: OwnedFd,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// A booted engine as seen by the worker runtime.
pub struct HostedEngine {
    /// Engine facade exported to the supervisor.
    pub engine: Arc<dyn RemoteObject>,
    /// Assistant facade exported to the supervisor.
    pub assistant: Arc<dyn RemoteObject>,
    /// Consumer of direct handles, if the engine accepts them.
    pub direct: Option<Arc<dyn DirectSink>>,
}

/// Builds the engine hosted by a worker.
pub trait EngineFactory: Send + Sync {
    /// Boot an engine for `options`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the supervisor as a failed `runEngine`.
    fn run_engine(
        &self,
        options: EngineOptions,
    ) -> Pin<Box<dyn Future<Output = Result<HostedEngine>> + Send + '_>>;
}

/// Root object announced in the `ready` message.
struct WorkerRoot {
    factory: Arc<dyn EngineFactory>,
    direct: Mutex<Option<Arc<dyn DirectSink>>>,
}

impl WorkerRoot {
    fn direct_sink(&self) -> Option<Arc<dyn DirectSink>> {
        self.direct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_engine(&self, ctx: &CallContext, args: &[Value]) -> Result<Value> {
        let options: EngineOptions = arg(args, 0, "runEngine")?;
        info!(account_id = %options.account_id, cache_dir = %options.cache_dir.display(), "booting engine");

        let hosted = self.factory.run_engine(options).await?;
        let engine = ctx.export(hosted.engine);
        let assistant = ctx.export(hosted.assistant);
        *self.direct.lock().unwrap_or_else(PoisonError::into_inner) = hosted.direct;

        Ok(json!({ "engine": engine, "assistant": assistant }))
    }
}

impl RemoteObject for WorkerRoot {
    fn interface(&self) -> &'static str {
        "WorkerRoot"
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "runEngine" => self.run_engine(ctx, &args).await,
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

/// Serve one worker process until the channel closes.
///
/// # Errors
///
/// Returns `AppError::Channel` if the socket cannot be reached, or
/// `AppError::ChannelClosed` if the supervisor hung up before `ready` was
/// sent.
pub async fn run_worker(channel_path: &Path, factory: Arc<dyn EngineFactory>) -> Result<()> {
    let stream = UnixStream::connect(channel_path).await.map_err(|err| {
        AppError::Channel(format!(
            "failed to connect to {}: {err}",
            channel_path.display()
        ))
    })?;

    let label = std::env::var(ACCOUNT_ID_ENV).unwrap_or_else(|_| "worker".into());
    let (channel, inbound) = ProcessChannel::open(&label, stream);
    let (transport, mut events) = RpcTransport::new(channel, inbound);

    let root = Arc::new(WorkerRoot {
        factory,
        direct: Mutex::new(None),
    });
    let root_ref = transport.export(Arc::clone(&root) as Arc<dyn RemoteObject>);
    transport.send_ready(root_ref).await?;
    info!(account_id = %label, pid = std::process::id(), "worker ready");

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Direct { id, handles } => deliver_direct(&root, &id, handles),
            TransportEvent::Ready(reference) => {
                debug!(root = reference.id, "ignoring ready from supervisor");
            }
        }
    }

    info!(account_id = %label, "channel closed, worker exiting");
    transport.close("channel closed");
    Ok(())
}

fn deliver_direct(root: &WorkerRoot, correlation_id: &str, handles: Vec<OwnedFd>) {
    let Some(sink) = root.direct_sink() else {
        warn!(correlation_id, "direct handle received before engine started, dropping");
        return;
    };
    if handles.is_empty() {
        warn!(correlation_id, "direct message without a handle");
    }

    for handle in handles {
        let sink = Arc::clone(&sink);
        let correlation_id = correlation_id.to_owned();
        tokio::spawn(async move {
            if let Err(err) = sink.accept(correlation_id.clone(), handle).await {
                warn!(correlation_id = %correlation_id, %err, "direct handle rejected");
            }
        });
    }
}

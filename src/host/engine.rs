//! Bundled engine served by `engine-worker`.
//!
//! A deliberately small facade surface: enough for the supervisor and its
//! tests to exercise calls, nested references, callbacks into the
//! supervisor, remote failures, long-running calls, and direct handles.

use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::host::{DirectSink, EngineFactory, EngineOptions, HostedEngine};
use crate::rpc::{arg, unknown_method, CallContext, InvokeFuture, RemoteObject, RemoteRef};
use crate::{AppError, Result};

/// Factory for [`BasicEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEngineFactory;

impl EngineFactory for BasicEngineFactory {
    fn run_engine(
        &self,
        options: EngineOptions,
    ) -> Pin<Box<dyn Future<Output = Result<HostedEngine>> + Send + '_>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&options.cache_dir)
                .await
                .map_err(|err| {
                    AppError::Io(format!(
                        "failed to create cache dir {}: {err}",
                        options.cache_dir.display()
                    ))
                })?;

            let engine = Arc::new(BasicEngine::new(options.account_id.clone(), options.cache_dir));
            let assistant = Arc::new(BasicAssistant {
                account_id: options.account_id,
            });

            Ok(HostedEngine {
                engine: Arc::clone(&engine) as Arc<dyn RemoteObject>,
                assistant,
                direct: Some(engine),
            })
        })
    }
}

/// Engine facade.
#[derive(Debug)]
pub struct BasicEngine {
    account_id: String,
    cache_dir: PathBuf,
    directs: Mutex<Vec<String>>,
}

impl BasicEngine {
    /// Create an engine for one account.
    #[must_use]
    pub fn new(account_id: String, cache_dir: PathBuf) -> Self {
        Self {
            account_id,
            cache_dir,
            directs: Mutex::new(Vec::new()),
        }
    }

    fn received_directs(&self) -> Vec<String> {
        self.directs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn notify(&self, ctx: &CallContext, args: &[Value]) -> Result<Value> {
        let listener: RemoteRef = arg(args, 0, "notify")?;
        let message: Value = arg(args, 1, "notify")?;
        let event = json!({ "accountId": self.account_id, "message": message });
        ctx.remote(listener)
            .call("onNotification", vec![event])
            .await
    }
}

impl RemoteObject for BasicEngine {
    fn interface(&self) -> &'static str {
        "Engine"
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "ping" => Ok(json!("pong")),
                "accountId" => Ok(json!(self.account_id)),
                "cacheDir" => Ok(json!(self.cache_dir.to_string_lossy())),
                "processId" => Ok(json!(std::process::id())),
                "sleep" => {
                    let millis: u64 = arg(&args, 0, method)?;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(json!(millis))
                }
                "fail" => {
                    let message: Option<String> = arg(&args, 0, method)?;
                    Err(AppError::Remote(
                        message.unwrap_or_else(|| "engine failure".into()),
                    ))
                }
                "deviceManager" => {
                    let manager = ctx.export(Arc::new(DeviceManager {
                        account_id: self.account_id.clone(),
                    }));
                    Ok(json!(manager))
                }
                "notify" => self.notify(ctx, &args).await,
                "directs" => Ok(json!(self.received_directs())),
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

impl DirectSink for BasicEngine {
    fn accept(
        &self,
        correlation_id: String,
        handle: OwnedFd,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let std_stream = std::os::unix::net::UnixStream::from(handle);
            std_stream.set_nonblocking(true)?;
            let mut stream = tokio::net::UnixStream::from_std(std_stream)?;
            stream
                .write_all(format!("hello {correlation_id}\n").as_bytes())
                .await?;
            stream.shutdown().await?;

            info!(account_id = %self.account_id, correlation_id = %correlation_id, "direct connection served");
            self.directs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(correlation_id);
            Ok(())
        })
    }
}

/// Nested facade returned by `Engine.deviceManager`.
#[derive(Debug)]
struct DeviceManager {
    account_id: String,
}

impl RemoteObject for DeviceManager {
    fn interface(&self) -> &'static str {
        "DeviceManager"
    }

    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        method: &'a str,
        _args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "list" => Ok(json!([
                    { "id": format!("{}-local", self.account_id), "kind": "local" }
                ])),
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

/// Assistant facade.
#[derive(Debug)]
struct BasicAssistant {
    account_id: String,
}

impl RemoteObject for BasicAssistant {
    fn interface(&self) -> &'static str {
        "Assistant"
    }

    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "accountId" => Ok(json!(self.account_id)),
                "ask" => {
                    let question: String = arg(&args, 0, method)?;
                    Ok(json!(format!("{}: {question}", self.account_id)))
                }
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

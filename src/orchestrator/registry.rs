//! Tenant registry: account id → running worker and its engine facades.
//!
//! The registry holds at most one slot per account. A slot is either
//! `Starting` (an in-flight start every concurrent caller joins) or
//! `Running` (handshake and engine bootstrap done). Worker exit removes the
//! slot through an exit listener; the registry never restarts a worker on
//! its own.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::account::{validate_account_id, Account};
use crate::models::worker::WorkerState;
use crate::orchestrator::worker_handle::{EngineFacades, WorkerHandle};
use crate::persistence::AccountStore;
use crate::{AppError, Result};

type ReadyFuture = Shared<BoxFuture<'static, Result<EngineFacades>>>;

/// A running tenant.
#[derive(Debug, Clone)]
pub struct TenantEntry {
    /// Account served.
    pub account: Account,
    /// Worker hosting the account's engine.
    pub worker: WorkerHandle,
    /// Facades returned by the engine bootstrap.
    pub facades: EngineFacades,
}

enum Slot {
    Starting {
        worker: WorkerHandle,
        ready: ReadyFuture,
    },
    Running(TenantEntry),
}

impl Slot {
    fn worker(&self) -> &WorkerHandle {
        match self {
            Self::Starting { worker, .. } => worker,
            Self::Running(entry) => &entry.worker,
        }
    }
}

/// Outcome of [`TenantRegistry::start_all`].
#[derive(Debug, Default)]
pub struct StartAllSummary {
    /// Accounts now running.
    pub started: Vec<String>,
    /// Accounts that failed to start, with the reason.
    pub failed: Vec<(String, AppError)>,
}

struct RegistryInner {
    config: Arc<GlobalConfig>,
    store: Arc<dyn AccountStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Registry of per-account workers; cheap to clone.
#[derive(Clone)]
pub struct TenantRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("tenants", &self.slots().len())
            .finish_non_exhaustive()
    }
}

impl TenantRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, store: Arc<dyn AccountStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start every account in the store concurrently.
    ///
    /// Per-account failures are logged and collected; they never stop the
    /// other accounts from starting.
    ///
    /// # Errors
    ///
    /// Returns an error only if the account list itself cannot be loaded.
    pub async fn start_all(&self) -> Result<StartAllSummary> {
        let accounts = self.inner.store.list_accounts().await?;
        info!(count = accounts.len(), "starting all tenants");

        let attempts = accounts.into_iter().map(|account| {
            let registry = self.clone();
            async move {
                let account_id = account.id.clone();
                let result = registry.start_account(account).await;
                (account_id, result)
            }
        });

        let mut summary = StartAllSummary::default();
        for (account_id, result) in join_all(attempts).await {
            match result {
                Ok(_) | Err(AppError::AlreadyRunning(_)) => summary.started.push(account_id),
                Err(err) => {
                    warn!(account_id, %err, "tenant failed to start");
                    summary.failed.push((account_id, err));
                }
            }
        }

        info!(
            started = summary.started.len(),
            failed = summary.failed.len(),
            "tenant startup complete"
        );
        Ok(summary)
    }

    /// Start the worker for a registered account.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the account is unknown.
    /// - `AppError::AlreadyRunning` if it is already running.
    /// - Any spawn, handshake, or bootstrap failure.
    pub async fn start(&self, account_id: &str) -> Result<EngineFacades> {
        let account = self.load_account(account_id).await?;
        self.start_account(account).await
    }

    /// Start the worker for `account` without consulting the store.
    ///
    /// A start issued while another start for the same account is in flight
    /// joins it and observes the same outcome.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_account(&self, account: Account) -> Result<EngineFacades> {
        validate_account_id(&account.id)?;

        let ready = {
            let mut slots = self.slots();
            match slots.get(&account.id) {
                Some(Slot::Running(entry)) if entry.worker.state() == WorkerState::Ready => {
                    return Err(AppError::AlreadyRunning(format!("account {}", account.id)));
                }
                Some(Slot::Starting { worker, ready }) if worker.state().is_live() => {
                    debug!(account_id = %account.id, "joining in-flight start");
                    ready.clone()
                }
                _ => {
                    let worker = self.new_worker(&account.id);
                    let account_id = account.id.clone();
                    let ready = self.launch(account, worker.clone(), None);
                    slots.insert(
                        account_id,
                        Slot::Starting {
                            worker,
                            ready: ready.clone(),
                        },
                    );
                    ready
                }
            }
        };

        ready.await
    }

    /// Facades of a running account. Never starts anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` unless the account's worker is ready.
    pub fn get(&self, account_id: &str) -> Result<EngineFacades> {
        match self.slots().get(account_id) {
            Some(Slot::Running(entry)) if entry.worker.state() == WorkerState::Ready => {
                Ok(entry.facades.clone())
            }
            _ => Err(AppError::NotRunning(format!("account {account_id}"))),
        }
    }

    /// Snapshot of a running account's entry.
    #[must_use]
    pub fn entry(&self, account_id: &str) -> Option<TenantEntry> {
        match self.slots().get(account_id) {
            Some(Slot::Running(entry)) if entry.worker.state() == WorkerState::Ready => {
                Some(entry.clone())
            }
            _ => None,
        }
    }

    /// Whether the account has a ready worker.
    #[must_use]
    pub fn is_running(&self, account_id: &str) -> bool {
        self.get(account_id).is_ok()
    }

    /// OS process id of the account's live worker, if any.
    #[must_use]
    pub fn process_id(&self, account_id: &str) -> Option<u32> {
        self.slots()
            .get(account_id)
            .map(Slot::worker)
            .filter(|worker| worker.state().is_live())
            .and_then(WorkerHandle::pid)
    }

    /// Accounts with a live slot, sorted.
    #[must_use]
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Kill the account's worker. Returns whether a live worker was stopped;
    /// stopping an unknown or stopped account is a no-op.
    pub fn stop(&self, account_id: &str) -> bool {
        let removed = self.slots().remove(account_id);
        let Some(slot) = removed else {
            debug!(account_id, "stop: no worker");
            return false;
        };

        let worker = slot.worker();
        let was_live = worker.state().is_live();
        worker.kill();
        info!(account_id, pid = worker.pid(), "tenant stopped");
        was_live
    }

    /// Kill every worker. Returns how many were live.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, Slot)> = self.slots().drain().collect();
        let mut stopped = 0;
        for (account_id, slot) in drained {
            let worker = slot.worker();
            if worker.state().is_live() {
                stopped += 1;
            }
            worker.kill();
            debug!(account_id, "tenant stopped during stop_all");
        }
        info!(stopped, "all tenants stopped");
        stopped
    }

    /// Stop the account's worker (if any) and start a fresh one after the
    /// configured restart delay.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start); `AlreadyRunning` is never returned.
    pub async fn restart(&self, account_id: &str) -> Result<EngineFacades> {
        let account = self.load_account(account_id).await?;

        // Swap slots under one guard so no concurrent start can slip in
        // between. The displaced worker is killed once the guard is gone and
        // only then is the replacement allowed to spawn.
        let (go, gate) = oneshot::channel();
        let (ready, displaced) = {
            let mut slots = self.slots();
            let worker = match slots.get(account_id) {
                Some(slot) => slot
                    .worker()
                    .successor(self.inner.config.restart_delay()),
                None => self.new_worker(account_id),
            };
            let ready = self.launch(account, worker.clone(), Some(gate));
            let displaced = slots.insert(
                account_id.to_owned(),
                Slot::Starting {
                    worker,
                    ready: ready.clone(),
                },
            );
            (ready, displaced)
        };
        if let Some(slot) = displaced {
            slot.worker().kill();
        }
        let _ = go.send(());
        info!(account_id, "restarting tenant");

        ready.await
    }

    /// Stop the account's worker and remove its working and cache
    /// directories. The account record itself is left in the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an invalid id, or `AppError::Io` if
    /// a directory exists but cannot be removed.
    pub async fn delete(&self, account_id: &str) -> Result<()> {
        validate_account_id(account_id)?;
        self.stop(account_id);

        let dirs = self.inner.config.tenant_dirs(account_id);
        remove_dir_if_present(&dirs.cache_dir).await?;
        remove_dir_if_present(&dirs.working_dir).await?;
        info!(account_id, "tenant state deleted");
        Ok(())
    }

    /// Hand an OS resource to the account's worker.
    ///
    /// # Errors
    ///
    /// - `AppError::NotRunning` if the account has no ready worker.
    /// - `AppError::ChannelClosed` / `AppError::Channel` from the transfer.
    pub async fn send_direct(
        &self,
        account_id: &str,
        correlation_id: &str,
        handle: OwnedFd,
    ) -> Result<()> {
        let worker = self
            .slots()
            .get(account_id)
            .map(|slot| slot.worker().clone());
        match worker {
            Some(worker) => worker.send_direct(correlation_id, handle).await,
            None => Err(AppError::NotRunning(format!("account {account_id}"))),
        }
    }

    async fn load_account(&self, account_id: &str) -> Result<Account> {
        validate_account_id(account_id)?;
        self.inner
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {account_id}")))
    }

    fn new_worker(&self, account_id: &str) -> WorkerHandle {
        let config = &self.inner.config;
        WorkerHandle::new(
            account_id,
            config.tenant_dirs(account_id),
            config.spawn_config(),
        )
    }

    fn launch(
        &self,
        account: Account,
        worker: WorkerHandle,
        gate: Option<oneshot::Receiver<()>>,
    ) -> ReadyFuture {
        let registry = self.clone();
        let span = info_span!("tenant_start", account_id = %account.id);
        let task = tokio::spawn(
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                registry.bring_up(account, worker).await
            }
            .instrument(span),
        );
        async move {
            task.await
                .unwrap_or_else(|err| Err(AppError::Spawn(format!("start task failed: {err}"))))
        }
        .boxed()
        .shared()
    }

    async fn bring_up(&self, account: Account, worker: WorkerHandle) -> Result<EngineFacades> {
        let outcome = async {
            worker.start().await?;
            worker.run_engine().await
        }
        .await;

        let facades = match outcome {
            Ok(facades) => facades,
            Err(err) => {
                self.remove_if_current(&account.id, worker.id());
                worker.kill();
                return Err(err);
            }
        };

        {
            let mut slots = self.slots();
            let current = matches!(
                slots.get(&account.id),
                Some(Slot::Starting { worker: w, .. }) if w.id() == worker.id()
            );
            if !current || worker.state() != WorkerState::Ready {
                drop(slots);
                worker.kill();
                return Err(AppError::NotRunning(format!(
                    "start of account {} was superseded",
                    account.id
                )));
            }
            slots.insert(
                account.id.clone(),
                Slot::Running(TenantEntry {
                    account: account.clone(),
                    worker: worker.clone(),
                    facades: facades.clone(),
                }),
            );
        }

        self.watch_exit(&worker);
        info!(account_id = %account.id, pid = worker.pid(), "tenant running");
        Ok(facades)
    }

    fn watch_exit(&self, worker: &WorkerHandle) {
        let registry = Arc::downgrade(&self.inner);
        let account_id = worker.account_id().to_owned();
        let handle_id = worker.id();
        worker.on_exit(move |exit| {
            let Some(inner) = registry.upgrade() else {
                return;
            };
            if (Self { inner }).remove_if_current(&account_id, handle_id) {
                info!(account_id, reason = %exit.reason, "tenant entry removed after worker exit");
            }
        });
    }

    fn remove_if_current(&self, account_id: &str, handle_id: u64) -> bool {
        let mut slots = self.slots();
        let current = slots
            .get(account_id)
            .is_some_and(|slot| slot.worker().id() == handle_id);
        if current {
            slots.remove(account_id);
        }
        current
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(format!(
            "failed to remove {}: {err}",
            path.display()
        ))),
    }
}

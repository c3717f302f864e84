use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backend::CoordinationClient;
use crate::config::MissingNodePolicy;
use crate::dispatcher::{ChangeDispatcher, ChangeHandlers, DispatchContext, DispatchStats};
use crate::{
    ChangeEvent, ConnectionPhase, Error, MemberRecord, RegistrationConfig, RegistrationPath,
    Result,
};

/// Background tasks wired by one successful startup.
struct Running {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Counters for the whole notification pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub dispatch: DispatchStats,
    /// Events the backend delivered while the dispatch queue was full.
    pub dropped: u64,
}

/// Registers the local process as an ephemeral member and wires change
/// notifications into a [`ChangeDispatcher`].
///
/// `start()` runs its startup sequence at most once, however many callers
/// race on it. Connection loss is reported through logs and
/// [`subscribe_connection`](Self::subscribe_connection), never as an error;
/// re-creating the ephemeral node after a session ends is left to the backend.
pub struct RegistrationManager {
    client: Arc<dyn CoordinationClient>,
    member: Arc<MemberRecord>,
    path: RegistrationPath,
    handlers: Arc<ChangeHandlers>,
    config: RegistrationConfig,
    started: AtomicBool,
    closed: AtomicBool,
    dispatcher: ArcSwapOption<ChangeDispatcher>,
    committed_path: ArcSwapOption<String>,
    cancel_token: CancellationToken,
    running: tokio::sync::Mutex<Option<Running>>,
    /// Queues of the current drain tasks. Backend listeners are registered
    /// once and feed whichever queue is installed here.
    connection_queue: Arc<ArcSwapOption<mpsc::Sender<ConnectionPhase>>>,
    change_queue: Arc<ArcSwapOption<mpsc::Sender<ChangeEvent>>>,
    subscribed: AtomicBool,
    connection_tx: broadcast::Sender<ConnectionPhase>,
    dropped: Arc<AtomicU64>,
}

impl Drop for RegistrationManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::debug!(
                instance_id = %self.member.instance_id(),
                "RegistrationManager dropped (close should be called explicitly)"
            );
        }
    }
}

impl RegistrationManager {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        member: MemberRecord,
        path: RegistrationPath,
    ) -> Self {
        let (connection_tx, _) = broadcast::channel(16);
        Self {
            client,
            member: Arc::new(member),
            path,
            handlers: Arc::new(ChangeHandlers::default()),
            config: RegistrationConfig::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dispatcher: ArcSwapOption::empty(),
            committed_path: ArcSwapOption::empty(),
            cancel_token: CancellationToken::new(),
            running: tokio::sync::Mutex::new(None),
            connection_queue: Arc::new(ArcSwapOption::empty()),
            change_queue: Arc::new(ArcSwapOption::empty()),
            subscribed: AtomicBool::new(false),
            connection_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_handlers(mut self, handlers: ChangeHandlers) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn with_config(mut self, config: RegistrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Register and begin dispatching. Only the first call does anything.
    ///
    /// In order: build the dispatcher, create the ephemeral sequential node,
    /// subscribe to connection state, subscribe to subtree changes, hydrate.
    ///
    /// # Errors
    ///
    /// - `Error::Closed` if [`close`](Self::close) already ran.
    /// - `Error::Config` if a queue capacity is zero.
    /// - `Error::Registration` if the node cannot be created, or a node left
    ///   by an earlier failed attempt cannot be removed. Nothing is retried;
    ///   the guard is released so the caller may call `start()` again.
    /// - `Error::Hydration` if the snapshot cannot be fetched. The node just
    ///   created is removed before returning. If that removal fails too, the
    ///   path stays in [`committed_path`](Self::committed_path) and the next
    ///   `start()` or [`unregister_app`](Self::unregister_app) removes it.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.config.validate()?;
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("start() ignored, already started");
            return Ok(());
        }

        if let Err(e) = self.run_startup().await {
            tracing::error!(namespace = %self.path, "Startup failed: {}", e);
            self.abort_startup().await;
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    async fn run_startup(&self) -> Result<()> {
        let context =
            DispatchContext::new(self.client.clone(), self.member.clone(), self.path.clone());
        let dispatcher = Arc::new(ChangeDispatcher::new(context, self.handlers.clone()));
        self.dispatcher.store(Some(dispatcher.clone()));

        self.remove_stale_node().await?;
        self.register_app().await?;

        let cancel = self.cancel_token.child_token();
        let handles = vec![
            self.spawn_connection_task(cancel.clone()),
            self.spawn_change_task(dispatcher.clone(), cancel.clone()),
        ];
        *self.running.lock().await = Some(Running { cancel, handles });
        self.subscribe_backend();

        dispatcher.init_data().await?;
        Ok(())
    }

    /// Remove a node an aborted startup could not clean up.
    async fn remove_stale_node(&self) -> Result<()> {
        let Some(path) = self.committed_path.load_full() else {
            return Ok(());
        };
        self.remove_committed(&path).await.map_err(|e| {
            Error::Registration(format!("stale node {} still registered: {}", path, e))
        })?;
        tracing::info!(path = %path, "Removed stale member node");
        Ok(())
    }

    /// Remove `path` and forget it. A node that is already gone counts as
    /// removed; on any other failure the path stays committed.
    async fn remove_committed(&self, path: &str) -> Result<()> {
        match self.client.remove_node(path).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {
                tracing::debug!(path = %path, "Member node already gone");
            }
            Err(e) => return Err(e),
        }
        self.committed_path.store(None);
        Ok(())
    }

    async fn register_app(&self) -> Result<String> {
        let payload = self.member.to_bytes()?;
        let committed = self
            .client
            .create_ephemeral_sequential(&self.path.member_prefix(), payload)
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;

        self.committed_path.store(Some(Arc::new(committed.clone())));
        tracing::info!(
            path = %committed,
            address = %self.member.address(),
            "Registered member"
        );
        Ok(committed)
    }

    /// Undo a partial startup so a later `start()` begins from scratch.
    async fn abort_startup(&self) {
        self.connection_queue.store(None);
        self.change_queue.store(None);
        if let Some(running) = self.running.lock().await.take() {
            running.cancel.cancel();
            for handle in running.handles {
                let _ = handle.await;
            }
        }
        if let Some(path) = self.committed_path.load_full() {
            if let Err(e) = self.remove_committed(&path).await {
                tracing::warn!(
                    path = %path,
                    "Failed to remove node after aborted startup, kept for retry: {}",
                    e
                );
            }
        }
        self.dispatcher.store(None);
    }

    /// Register the backend listeners. Runs on the first startup attempt
    /// only; retries install fresh queues behind the same listeners.
    fn subscribe_backend(&self) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return;
        }

        let queue = self.connection_queue.clone();
        self.client
            .subscribe_connection_state(Box::new(move |phase| {
                let Some(tx) = queue.load_full() else {
                    return;
                };
                if let Err(TrySendError::Full(phase)) = tx.try_send(phase) {
                    tracing::warn!(%phase, "Connection queue full, dropping phase");
                }
            }));

        let queue = self.change_queue.clone();
        let dropped = self.dropped.clone();
        self.client
            .subscribe_subtree_changes(Box::new(move |event| {
                let Some(tx) = queue.load_full() else {
                    return;
                };
                if let Err(TrySendError::Full(event)) = tx.try_send(event) {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        path = %event.path(),
                        kind = %event.kind,
                        "Change queue full, dropping event"
                    );
                }
            }));
    }

    fn spawn_connection_task(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<ConnectionPhase>(self.config.connection_queue_capacity);
        self.connection_queue.store(Some(Arc::new(tx)));

        let member = self.member.clone();
        let events = self.connection_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    phase = rx.recv() => match phase {
                        Some(phase) => {
                            log_connection_phase(&member, phase);
                            let _ = events.send(phase);
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("Connection listener shutting down");
        })
    }

    fn spawn_change_task(
        &self,
        dispatcher: Arc<ChangeDispatcher>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(self.config.event_queue_capacity);
        self.change_queue.store(Some(Arc::new(tx)));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => dispatcher.handle(event),
                        None => break,
                    }
                }
            }
            tracing::debug!("Change listener shutting down");
        })
    }

    /// Remove the node created by `start()`.
    ///
    /// A manager that never registered has nothing to remove and returns
    /// `Ok(())`. A node that is already gone is handled per
    /// [`MissingNodePolicy`]. Any other removal failure is logged and
    /// swallowed: the path stays committed, so a later `unregister_app()` or
    /// `start()` retries the removal, and the session's end removes the
    /// ephemeral node regardless.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoNode` under `MissingNodePolicy::Report` only.
    pub async fn unregister_app(&self) -> Result<()> {
        let Some(path) = self.committed_path.load_full() else {
            tracing::debug!(namespace = %self.path, "Nothing registered, skipping unregister");
            return Ok(());
        };

        match self.client.remove_node(&path).await {
            Ok(()) => {
                self.committed_path.store(None);
                tracing::info!(path = %path, "Unregistered member");
                Ok(())
            }
            Err(e) if e.is_no_node() => {
                self.committed_path.store(None);
                match self.config.missing_node_policy {
                    MissingNodePolicy::Ignore => {
                        tracing::debug!(path = %path, "Member node already gone");
                        Ok(())
                    }
                    MissingNodePolicy::Report => {
                        tracing::warn!(path = %path, "Member node already gone");
                        Err(e)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %path, "Failed to unregister member, path kept: {}", e);
                Ok(())
            }
        }
    }

    /// Stop dispatching and close the backend session. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel_token.cancel();
        self.connection_queue.store(None);
        self.change_queue.store(None);
        if let Some(running) = self.running.lock().await.take() {
            for handle in running.handles {
                let _ = handle.await;
            }
        }

        self.client.close_connection().await;
        tracing::info!(
            instance_id = %self.member.instance_id(),
            "Registration manager closed"
        );
    }

    /// Subscribe to connection phases, published after they are logged.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionPhase> {
        self.connection_tx.subscribe()
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn member(&self) -> &MemberRecord {
        &self.member
    }

    pub fn path(&self) -> &RegistrationPath {
        &self.path
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Path the backend committed for this member, if currently registered.
    ///
    /// Also set after a failed `start()` whose cleanup could not reach the
    /// backend.
    pub fn committed_path(&self) -> Option<String> {
        self.committed_path.load_full().map(|p| (*p).clone())
    }

    pub fn dispatcher(&self) -> Option<Arc<ChangeDispatcher>> {
        self.dispatcher.load_full()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            dispatch: self.dispatcher().map(|d| d.stats()).unwrap_or_default(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

fn log_connection_phase(member: &MemberRecord, phase: ConnectionPhase) {
    match phase {
        ConnectionPhase::Lost => {
            tracing::warn!(ip = %member.ip(), "{}, lost connection", member.ip());
        }
        ConnectionPhase::Reconnected => {
            tracing::warn!(ip = %member.ip(), "{}, reconnected", member.ip());
        }
        ConnectionPhase::Connected => {}
    }
}

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::CoordinationClient;
use crate::{ChangeEvent, ChangeKind, Error, MemberRecord, RegistrationPath, Result};

/// Error type returned by change handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), HandlerError>;

type HandlerFn = Box<dyn Fn(&DispatchContext, &ChangeEvent, &str) -> HandlerResult + Send + Sync>;

/// Backend handles given to every handler invocation.
#[derive(Clone)]
pub struct DispatchContext {
    client: Arc<dyn CoordinationClient>,
    member: Arc<MemberRecord>,
    namespace: RegistrationPath,
}

impl DispatchContext {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        member: Arc<MemberRecord>,
        namespace: RegistrationPath,
    ) -> Self {
        Self {
            client,
            member,
            namespace,
        }
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// The local member, as registered.
    pub fn member(&self) -> &MemberRecord {
        &self.member
    }

    pub fn namespace(&self) -> &RegistrationPath {
        &self.namespace
    }
}

/// Dispatch table with one handler per [`ChangeKind`].
///
/// Unset entries are no-ops. `Added` must be treated as an upsert: during
/// startup a watch event can arrive for a node the snapshot also reports,
/// or for one it has not seen yet.
pub struct ChangeHandlers {
    added: HandlerFn,
    updated: HandlerFn,
    removed: HandlerFn,
    other: HandlerFn,
}

fn noop() -> HandlerFn {
    Box::new(|_, _, _| Ok(()))
}

impl Default for ChangeHandlers {
    fn default() -> Self {
        Self {
            added: noop(),
            updated: noop(),
            removed: noop(),
            other: noop(),
        }
    }
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DispatchContext, &ChangeEvent, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.added = Box::new(handler);
        self
    }

    pub fn on_updated<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DispatchContext, &ChangeEvent, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.updated = Box::new(handler);
        self
    }

    pub fn on_removed<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DispatchContext, &ChangeEvent, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.removed = Box::new(handler);
        self
    }

    pub fn on_other<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DispatchContext, &ChangeEvent, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.other = Box::new(handler);
        self
    }

    fn entry(&self, kind: ChangeKind) -> &HandlerFn {
        match kind {
            ChangeKind::Added => &self.added,
            ChangeKind::Updated => &self.updated,
            ChangeKind::Removed => &self.removed,
            ChangeKind::Other => &self.other,
        }
    }
}

/// Counters kept by a [`ChangeDispatcher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Handler invocations that returned `Ok`.
    pub dispatched: u64,
    /// Events dropped because they carried no path.
    pub discarded: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
}

/// Routes change events to the handler table and performs startup hydration.
///
/// Handler calls never overlap, whether they come from the watch queue or
/// from hydration.
pub struct ChangeDispatcher {
    context: DispatchContext,
    handlers: Arc<ChangeHandlers>,
    hydrated: AtomicBool,
    invoke_lock: Mutex<()>,
    dispatched: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
}

impl ChangeDispatcher {
    pub fn new(context: DispatchContext, handlers: Arc<ChangeHandlers>) -> Self {
        tracing::debug!(
            namespace = %context.namespace,
            instance_id = %context.member.instance_id(),
            "Change dispatcher created"
        );
        Self {
            context,
            handlers,
            hydrated: AtomicBool::new(false),
            invoke_lock: Mutex::new(()),
            dispatched: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &DispatchContext {
        &self.context
    }

    /// Route one change event.
    ///
    /// Events without a resolvable path are discarded with a warning. Handler
    /// errors and panics are logged with the event's path and kind; they never
    /// reach the caller.
    pub fn handle(&self, event: ChangeEvent) {
        let kind = event.kind;
        let path = event.path().to_string();
        if path.is_empty() {
            tracing::warn!(%kind, "Discarding change event with empty path");
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let handler = self.handlers.entry(kind);
        let _guard = self
            .invoke_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match panic::catch_unwind(AssertUnwindSafe(|| handler(&self.context, &event, &path))) {
            Ok(Ok(())) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%path, %kind, "Change dispatched");
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%path, %kind, "Change handler failed: {}", e);
            }
            Err(payload) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    %path,
                    %kind,
                    "Change handler panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Feed the current namespace snapshot to the handlers as `Added` events.
    ///
    /// Runs once; later calls log a warning and return `Ok(0)`. Returns the
    /// number of nodes in the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Hydration` if the snapshot cannot be fetched.
    pub async fn init_data(&self) -> Result<usize> {
        if self.hydrated.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                namespace = %self.context.namespace,
                "Hydration already performed, skipping"
            );
            return Ok(0);
        }

        let snapshot = self
            .context
            .client
            .fetch_subtree_snapshot(self.context.namespace.as_str())
            .await
            .map_err(|e| Error::Hydration(e.to_string()))?;

        let count = snapshot.len();
        for (path, payload) in snapshot {
            self.handle(ChangeEvent::new(ChangeKind::Added, path, Some(payload)));
        }

        tracing::info!(namespace = %self.context.namespace, count, "Hydrated namespace snapshot");
        Ok(count)
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

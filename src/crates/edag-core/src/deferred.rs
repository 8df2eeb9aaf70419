//! Deferred node results
//!
//! A [`Deferred`] decouples starting a node's work from waiting for its value.
//! Constructing one only captures the unit and its bound arguments;
//! [`start`](Deferred::start) spawns the call onto the tokio runtime and
//! [`resolve`](Deferred::resolve) waits for it, starting it first if needed.
//!
//! The executor launches every deferred node of a generation before resolving
//! any of them, so independent units overlap.
//!
//! Resolution is cached: the first outcome (value or failure) is returned by
//! every later call, and the unit is invoked at most once.
//!
//! Handles compose with [`map`](Deferred::map) and
//! [`and_then`](Deferred::and_then). The composed handle is itself deferred:
//! it resolves its source when it is started or resolved, and a failure of
//! the source comes through untouched.

use crate::binder::Arguments;
use crate::error::{BoxError, NodeFailure};
use crate::node::Unit;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinHandle;

enum Launch {
    Pending {
        unit: Unit,
        args: Arguments,
        limiter: Option<Arc<Semaphore>>,
    },
    Composed(BoxFuture<'static, Result<Value, NodeFailure>>),
    Running(JoinHandle<Result<Value, NodeFailure>>),
    Settled,
}

struct Inner {
    node: String,
    launch: Mutex<Launch>,
    outcome: OnceCell<Result<Value, NodeFailure>>,
}

/// Handle to a node call that may still be running.
///
/// Cloning the handle shares the same call and the same cached outcome.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<Inner>,
}

impl Deferred {
    pub(crate) fn new(
        node: impl Into<String>,
        unit: Unit,
        args: Arguments,
        limiter: Option<Arc<Semaphore>>,
    ) -> Self {
        Self::with_launch(node.into(), Launch::Pending { unit, args, limiter }, None)
    }

    /// An already-resolved handle.
    pub fn from_value(node: impl Into<String>, value: Value) -> Self {
        Self::with_launch(node.into(), Launch::Settled, Some(Ok(value)))
    }

    /// An already-failed handle.
    pub fn from_failure(node: impl Into<String>, failure: NodeFailure) -> Self {
        Self::with_launch(node.into(), Launch::Settled, Some(Err(failure)))
    }

    fn with_launch(
        node: String,
        launch: Launch,
        outcome: Option<Result<Value, NodeFailure>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                node,
                launch: Mutex::new(launch),
                outcome: OnceCell::new_with(outcome),
            }),
        }
    }

    /// Name of the node this call belongs to.
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Spawn the call if it has not been spawned yet.
    ///
    /// Must be called from within a tokio runtime. Does nothing while another
    /// task is resolving the handle, since resolving starts the call itself.
    pub fn start(&self) {
        if let Ok(mut launch) = self.inner.launch.try_lock() {
            Self::launch(&mut launch);
        }
    }

    fn launch(launch: &mut Launch) {
        *launch = match std::mem::replace(launch, Launch::Settled) {
            Launch::Pending {
                unit,
                args,
                limiter,
            } => Launch::Running(unit.spawn(args, limiter)),
            Launch::Composed(work) => Launch::Running(tokio::spawn(work)),
            other => other,
        };
    }

    /// Handle resolving to `f` applied to this handle's value.
    ///
    /// `f` runs at most once. If this handle fails, the failure is passed on
    /// unchanged and `f` is never called; an error returned by `f` becomes a
    /// [`NodeFailure::Unit`].
    pub fn map<F>(&self, f: F) -> Deferred
    where
        F: FnOnce(Value) -> Result<Value, BoxError> + Send + 'static,
    {
        let source = self.clone();
        let work: BoxFuture<'static, Result<Value, NodeFailure>> = async move {
            let value = source.resolve().await?;
            f(value).map_err(NodeFailure::unit)
        }
        .boxed();
        Self::with_launch(self.node().to_string(), Launch::Composed(work), None)
    }

    /// Handle resolving to the handle `f` builds from this handle's value.
    pub fn and_then<F>(&self, f: F) -> Deferred
    where
        F: FnOnce(Value) -> Deferred + Send + 'static,
    {
        let source = self.clone();
        let work: BoxFuture<'static, Result<Value, NodeFailure>> = async move {
            let next = f(source.resolve().await?);
            next.resolve().await
        }
        .boxed();
        Self::with_launch(self.node().to_string(), Launch::Composed(work), None)
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.outcome.initialized()
    }

    /// Wait for the call and return its outcome.
    ///
    /// A failure of the unit is returned as-is on every resolution; it is
    /// never swallowed or replaced.
    pub async fn resolve(&self) -> Result<Value, NodeFailure> {
        self.inner
            .outcome
            .get_or_init(|| self.settle())
            .await
            .clone()
    }

    async fn settle(&self) -> Result<Value, NodeFailure> {
        let mut launch = self.inner.launch.lock().await;
        Self::launch(&mut launch);

        let outcome = match &mut *launch {
            Launch::Running(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(NodeFailure::Panicked(join_error.to_string())),
            },
            _ => Err(NodeFailure::Panicked(format!(
                "deferred call of '{}' has no running task",
                self.inner.node
            ))),
        };
        *launch = Launch::Settled;
        outcome
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("node", &self.inner.node)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

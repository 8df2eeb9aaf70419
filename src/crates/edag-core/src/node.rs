//! Graph vertices wrapping computation units
//!
//! A [`Node`] pairs a unit (a plain or async function over named
//! [`Arguments`]) with everything the executor needs to place it in a graph:
//! a display name, the output key its result is published under, bound
//! parameters, an execution mode and an identity.
//!
//! # Identity
//!
//! Every node carries a [`NodeId`]. Two nodes with the same name, unit and
//! parameters but different ids are distinct vertices, which is how one
//! function is reused at several positions of a plan. All derivations
//! (`with_alias`, `with_output`, `with_params`, `clone_with`, the mode and
//! marker methods) return a new node with a fresh id and leave the original
//! untouched. The `Clone` trait copies the handle and keeps the id: a cloned
//! `Node` is the same vertex.
//!
//! # Examples
//!
//! ```rust
//! use edag_core::{Node, Signature};
//! use serde_json::{json, Value};
//!
//! let double = Node::wrap("double", Signature::new(["x"]), |args| {
//!     let x = args.get("x").and_then(Value::as_i64).ok_or("x must be an integer")?;
//!     Ok(json!(x * 2))
//! });
//!
//! assert_eq!(double.output_key(), "double");
//! let renamed = double.with_alias("twice");
//! assert_eq!(renamed.output_key(), "twice");
//! assert_ne!(renamed.id(), double.id());
//! ```

use crate::binder::{Arguments, Signature};
use crate::deferred::Deferred;
use crate::error::{BoxError, NodeFailure};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result type returned by units.
pub type UnitResult = std::result::Result<Value, BoxError>;

/// Synchronous unit function.
pub type SyncUnitFn = Arc<dyn Fn(Arguments) -> UnitResult + Send + Sync>;

/// Asynchronous unit function.
pub type AsyncUnitFn = Arc<dyn Fn(Arguments) -> BoxFuture<'static, UnitResult> + Send + Sync>;

/// Opaque, unique node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// How a node's unit is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run in place; `execute` returns the value
    Inline,
    /// Return a [`Deferred`] handle; the executor spawns it
    #[default]
    Deferred,
}

/// Which input an iterator-marked node iterates over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterSource {
    /// The output key of the node's single upstream node
    Upstream,
    /// An explicit input key
    Key(String),
}

/// The wrapped computation, as a closed set of kinds.
#[derive(Clone)]
pub(crate) enum Unit {
    Sync(SyncUnitFn),
    Async(AsyncUnitFn),
    /// Returns its arguments unchanged, as an object
    Forward,
}

impl Unit {
    pub(crate) async fn call(&self, args: Arguments) -> Result<Value, NodeFailure> {
        match self {
            Unit::Sync(f) => f(args).map_err(NodeFailure::unit),
            Unit::Async(f) => f(args).await.map_err(NodeFailure::unit),
            Unit::Forward => Ok(Value::Object(args)),
        }
    }

    /// Spawn the call onto the runtime; synchronous units go to the blocking pool.
    pub(crate) fn spawn(
        self,
        args: Arguments,
        limiter: Option<Arc<Semaphore>>,
    ) -> JoinHandle<Result<Value, NodeFailure>> {
        tokio::spawn(self.run_detached(args, limiter))
    }

    async fn run_detached(
        self,
        args: Arguments,
        limiter: Option<Arc<Semaphore>>,
    ) -> Result<Value, NodeFailure> {
        let _permit = match limiter {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| NodeFailure::Panicked(e.to_string()))?,
            ),
            None => None,
        };

        match self {
            Unit::Sync(f) => tokio::task::spawn_blocking(move || f(args))
                .await
                .map_err(|e| NodeFailure::Panicked(e.to_string()))?
                .map_err(NodeFailure::unit),
            other => other.call(args).await,
        }
    }
}

/// What a node invocation produced
#[derive(Debug)]
pub enum Invocation {
    /// Inline node result
    Ready(Value),
    /// Deferred node handle
    Deferred(Deferred),
}

impl Invocation {
    /// The value, waiting for the deferred call if necessary.
    pub async fn resolve(self) -> Result<Value, NodeFailure> {
        match self {
            Invocation::Ready(value) => Ok(value),
            Invocation::Deferred(deferred) => deferred.resolve().await,
        }
    }
}

/// A graph vertex wrapping one computation unit
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    output_key: Option<String>,
    unit: Unit,
    signature: Arc<Signature>,
    bound: Arguments,
    mode: ExecutionMode,
    explode: bool,
    iterate: Option<IterSource>,
}

impl Node {
    fn from_unit(name: impl Into<String>, signature: Signature, unit: Unit) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            output_key: None,
            unit,
            signature: Arc::new(signature),
            bound: Arguments::new(),
            mode: ExecutionMode::default(),
            explode: false,
            iterate: None,
        }
    }

    /// Wrap a synchronous function. The node starts in deferred mode.
    pub fn wrap<F>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(Arguments) -> UnitResult + Send + Sync + 'static,
    {
        Self::from_unit(name, signature, Unit::Sync(Arc::new(f)))
    }

    /// Wrap an async function. The node starts in deferred mode.
    ///
    /// ```rust
    /// use edag_core::{Node, Signature};
    /// use serde_json::json;
    ///
    /// let fetch = Node::wrap_async("fetch", Signature::new(["url"]), |args| async move {
    ///     Ok(json!({ "url": args["url"], "status": 200 }))
    /// });
    /// assert!(!fetch.is_inline());
    /// ```
    pub fn wrap_async<F, Fut>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult> + Send + 'static,
    {
        let unit: AsyncUnitFn = Arc::new(move |args: Arguments| -> BoxFuture<'static, UnitResult> {
            Box::pin(f(args))
        });
        Self::from_unit(name, signature, Unit::Async(unit))
    }

    /// A node that republishes its direct predecessors' results unchanged.
    ///
    /// Lets a later node consume an upstream value next to a value derived
    /// from it, under restricted visibility, without re-running the upstream
    /// node: `a >> (Node::pass_through() | b) >> c`.
    pub fn pass_through() -> Self {
        let mut node = Self::from_unit("pass_through", Signature::variadic(), Unit::Forward);
        node.mode = ExecutionMode::Inline;
        node.explode = true;
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key the result is published under; the name unless overridden.
    pub fn output_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.name)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn bound_params(&self) -> &Arguments {
        &self.bound
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_inline(&self) -> bool {
        self.mode == ExecutionMode::Inline
    }

    pub fn is_exploded(&self) -> bool {
        self.explode
    }

    pub fn iterator(&self) -> Option<&IterSource> {
        self.iterate.as_ref()
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self.unit, Unit::Forward)
    }

    fn derive(&self) -> Self {
        let mut node = self.clone();
        node.id = NodeId::new();
        node
    }

    /// Same node under a new name. An output key that was never overridden
    /// follows the new name.
    pub fn with_alias(&self, name: impl Into<String>) -> Self {
        let mut node = self.derive();
        node.name = name.into();
        node
    }

    pub fn with_output(&self, key: impl Into<String>) -> Self {
        let mut node = self.derive();
        node.output_key = Some(key.into());
        node
    }

    /// Same node with additional bound parameters (new values win).
    pub fn with_params<I, K>(&self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut node = self.derive();
        node.bound.extend(params.into_iter().map(|(k, v)| (k.into(), v)));
        node
    }

    /// Identity-refreshing copy, optionally overriding bound parameters.
    pub fn clone_with<I, K>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.with_params(overrides)
    }

    pub fn inline(&self) -> Self {
        let mut node = self.derive();
        node.mode = ExecutionMode::Inline;
        node
    }

    pub fn deferred(&self) -> Self {
        let mut node = self.derive();
        node.mode = ExecutionMode::Deferred;
        node
    }

    /// Publish an object result as one entry per key.
    pub fn explode(&self) -> Self {
        let mut node = self.derive();
        node.explode = true;
        node
    }

    /// Run once per element of the upstream node's sequence result.
    pub fn iterate(&self) -> Self {
        let mut node = self.derive();
        node.iterate = Some(IterSource::Upstream);
        node
    }

    /// Run once per element of the sequence found under `key`.
    pub fn iterate_over(&self, key: impl Into<String>) -> Self {
        let mut node = self.derive();
        node.iterate = Some(IterSource::Key(key.into()));
        node
    }

    /// Invoke the node with call-time inputs.
    ///
    /// Call-time inputs override bound parameters of the same name. Binding
    /// failures are reported here, before the unit runs.
    pub async fn execute(&self, inputs: Arguments) -> Result<Invocation, NodeFailure> {
        self.execute_limited(inputs, None).await
    }

    pub(crate) async fn execute_limited(
        &self,
        inputs: Arguments,
        limiter: Option<Arc<Semaphore>>,
    ) -> Result<Invocation, NodeFailure> {
        let mut merged = self.bound.clone();
        merged.extend(inputs);

        let args = self.signature.bind(Vec::new(), merged)?;
        self.signature.check(&args)?;

        match self.mode {
            ExecutionMode::Inline => Ok(Invocation::Ready(self.unit.call(args).await?)),
            ExecutionMode::Deferred => Ok(Invocation::Deferred(Deferred::new(
                self.name.clone(),
                self.unit.clone(),
                args,
                limiter,
            ))),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("output_key", &self.output_key())
            .field("signature", &self.signature)
            .field("bound", &self.bound)
            .field("mode", &self.mode)
            .field("explode", &self.explode)
            .field("iterate", &self.iterate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BindingError;
    use serde_json::json;

    fn add() -> Node {
        Node::wrap("add", Signature::new(["x", "y"]), |args| {
            let x = args.get("x").and_then(Value::as_i64).ok_or("x must be an integer")?;
            let y = args.get("y").and_then(Value::as_i64).ok_or("y must be an integer")?;
            Ok(json!(x + y))
        })
    }

    fn inputs(pairs: &[(&str, Value)]) -> Arguments {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_inline_execution_returns_value() {
        let node = add().inline();
        let result = node.execute(inputs(&[("x", json!(2)), ("y", json!(3))])).await.unwrap();
        assert!(matches!(result, Invocation::Ready(ref v) if *v == json!(5)));
    }

    #[tokio::test]
    async fn test_deferred_execution_returns_handle() {
        let node = add();
        let invocation = node.execute(inputs(&[("x", json!(2)), ("y", json!(3))])).await.unwrap();
        let deferred = match invocation {
            Invocation::Deferred(deferred) => deferred,
            other => panic!("expected deferred, got {:?}", other),
        };
        assert_eq!(deferred.node(), "add");
        assert_eq!(deferred.resolve().await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_call_time_inputs_override_bound_params() {
        let node = add().with_params([("x", json!(100)), ("y", json!(1))]).inline();
        let value = node
            .execute(inputs(&[("x", json!(10))]))
            .await
            .unwrap()
            .resolve()
            .await
            .unwrap();
        assert_eq!(value, json!(11));
    }

    #[tokio::test]
    async fn test_missing_parameter_fails_before_running() {
        let node = add();
        let err = node.execute(inputs(&[("x", json!(1))])).await.unwrap_err();
        assert!(matches!(
            err,
            NodeFailure::Binding(BindingError::Missing { ref params })
                if params == &vec!["y".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_unit_error_propagates_inline() {
        let node = add().inline();
        let err = node
            .execute(inputs(&[("x", json!("one")), ("y", json!(1))]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "x must be an integer");
    }

    #[tokio::test]
    async fn test_async_unit() {
        let node = Node::wrap_async("shout", Signature::new(["text"]), |args| async move {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        });
        let value = node
            .execute(inputs(&[("text", json!("hi"))]))
            .await
            .unwrap()
            .resolve()
            .await
            .unwrap();
        assert_eq!(value, json!("HI"));
    }

    #[test]
    fn test_derivations_refresh_identity() {
        let base = add();
        let derived = [
            base.with_alias("sum"),
            base.with_output("total"),
            base.with_params([("x", json!(1))]),
            base.clone_with(Vec::<(String, Value)>::new()),
            base.inline(),
            base.explode(),
            base.iterate(),
        ];

        for node in &derived {
            assert_ne!(node.id(), base.id());
        }
        assert_eq!(base.clone().id(), base.id());
        assert_eq!(base.name(), "add");
        assert!(base.bound_params().is_empty());
        assert!(!base.is_inline());
    }

    #[test]
    fn test_output_key_follows_alias_unless_overridden() {
        let base = add();
        assert_eq!(base.with_alias("sum").output_key(), "sum");

        let fixed = base.with_output("total").with_alias("sum");
        assert_eq!(fixed.name(), "sum");
        assert_eq!(fixed.output_key(), "total");
    }

    #[tokio::test]
    async fn test_pass_through_forwards_arguments() {
        let node = Node::pass_through();
        assert!(node.is_pass_through());
        assert!(node.is_exploded());

        let value = node
            .execute(inputs(&[("a", json!(2))]))
            .await
            .unwrap()
            .resolve()
            .await
            .unwrap();
        assert_eq!(value, json!({"a": 2}));
    }
}

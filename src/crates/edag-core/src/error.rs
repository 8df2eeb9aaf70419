//! Error types for plan compilation and graph execution
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Cycle            - Plan compilation found a dependency cycle
//! ├── Validation       - Malformed plan (empty, conflicting markers, ...)
//! ├── Binding          - Visible inputs do not satisfy a node's parameters
//! ├── NodeExecution    - The wrapped unit failed or panicked
//! ├── InvalidOutput    - A result does not fit its node's marker (explode)
//! ├── InvalidInput     - An iterated input is not a sequence
//! ├── Store            - Result store failure
//! ├── Configuration    - Invalid executor configuration
//! ├── Serialization    - JSON errors
//! └── Yaml             - YAML errors
//! ```
//!
//! A failed run is reported as a [`RunFailure`], which pairs the
//! [`GraphError`] with the run id and the generation trace accumulated up to
//! the failure.
//!
//! # Matching Specific Errors
//!
//! ```rust
//! use edag_core::error::GraphError;
//!
//! fn describe(err: &GraphError) -> String {
//!     match err {
//!         GraphError::Cycle { nodes } => format!("cycle through {:?}", nodes),
//!         GraphError::Binding { node, source, .. } => {
//!             format!("'{}' cannot be called: {}", node, source)
//!         }
//!         other => other.to_string(),
//!     }
//! }
//! ```

use crate::binder::BindingError;
use crate::store::StoreError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Boxed error returned by node units.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// A unit's error behind an `Arc`, so one failure can be observed many times.
///
/// `Display` and `source()` forward to the original error unchanged.
#[derive(Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync>);

impl SharedError {
    pub fn new(error: BoxError) -> Self {
        Self(Arc::from(error))
    }

    /// The original error as raised by the unit.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Whether both handles point at the very same captured failure.
    pub fn ptr_eq(&self, other: &SharedError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Failure of a single node invocation, before run context is attached.
///
/// This is what [`Deferred::resolve`](crate::Deferred::resolve) caches, so it
/// is cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum NodeFailure {
    /// The merged inputs could not be bound to the unit's signature
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// The unit returned an error
    #[error(transparent)]
    Unit(SharedError),

    /// The unit panicked or its task was cancelled
    #[error("unit panicked: {0}")]
    Panicked(String),
}

impl NodeFailure {
    pub(crate) fn unit(error: BoxError) -> Self {
        Self::Unit(SharedError::new(error))
    }

    /// Attach node and run context, producing the error a run reports.
    pub fn into_graph_error(
        self,
        node: impl Into<String>,
        run_id: Uuid,
        generation: usize,
    ) -> GraphError {
        let node = node.into();
        match self {
            NodeFailure::Binding(source) => GraphError::Binding {
                node,
                run_id,
                generation,
                source,
            },
            NodeFailure::Unit(source) => GraphError::NodeExecution {
                node,
                run_id,
                generation,
                source,
            },
            NodeFailure::Panicked(message) => GraphError::NodeExecution {
                node,
                run_id,
                generation,
                source: SharedError::new(message.into()),
            },
        }
    }
}

/// Error type for all plan and execution operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Plan compilation found a dependency cycle
    ///
    /// Cycles arise when the same node (same identity) is composed on both
    /// sides of a path, e.g. `a >> b >> a`. Use
    /// [`Node::clone_with`](crate::Node::clone_with) to reuse a function at a
    /// second position.
    #[error("Plan contains a cycle through nodes: {}", nodes.join(", "))]
    Cycle {
        /// Names of the nodes that could not be ordered
        nodes: Vec<String>,
    },

    /// Plan structure is invalid
    #[error("Plan validation failed: {0}")]
    Validation(String),

    /// A node's visible inputs do not satisfy its parameters
    ///
    /// Most often caused by restricted visibility hiding the output of an
    /// indirect dependency. Run unrestricted or add a pass-through.
    #[error("Node '{node}' could not be bound in run {run_id} (generation {generation}): {source}")]
    Binding {
        node: String,
        run_id: Uuid,
        generation: usize,
        source: BindingError,
    },

    /// The wrapped unit failed; the original error is the source
    #[error("Node '{node}' execution failed in run {run_id} (generation {generation}): {source}")]
    NodeExecution {
        node: String,
        run_id: Uuid,
        generation: usize,
        source: SharedError,
    },

    /// A node produced a result its markers cannot publish
    #[error("Node '{node}' produced an invalid output: {reason}")]
    InvalidOutput { node: String, reason: String },

    /// A node received an input its markers cannot consume
    #[error("Node '{node}' received an invalid input: {reason}")]
    InvalidInput { node: String, reason: String },

    /// Result store failure
    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    /// Executor configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GraphError {
    /// Create a validation error
    ///
    /// ```rust
    /// use edag_core::error::GraphError;
    ///
    /// let err = GraphError::validation("plan has no nodes");
    /// assert_eq!(err.to_string(), "Plan validation failed: plan has no nodes");
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a node execution error from a unit's error
    pub fn node_execution(
        node: impl Into<String>,
        run_id: Uuid,
        generation: usize,
        error: BoxError,
    ) -> Self {
        Self::NodeExecution {
            node: node.into(),
            run_id,
            generation,
            source: SharedError::new(error),
        }
    }

    /// Name of the node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            GraphError::Binding { node, .. }
            | GraphError::NodeExecution { node, .. }
            | GraphError::InvalidOutput { node, .. }
            | GraphError::InvalidInput { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// A run that stopped at a failing generation.
///
/// Nothing from the failing generation is published; `generations` holds the
/// trace of every generation that completed before it (generation 0 being
/// the seed keys).
#[derive(Error, Debug)]
#[error("Run {run_id} failed at generation {generation}: {error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub generation: usize,
    pub generations: Vec<Vec<String>>,
    #[source]
    pub error: GraphError,
}

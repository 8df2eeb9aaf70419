//! # edag-core - Composable computation graphs with generation-based execution
//!
//! Wrap ordinary functions as graph nodes, compose them with two operators
//! into a directed acyclic graph, and run the graph one generation at a time,
//! with every independent node of a generation in flight together.
//!
//! ## Core Concepts
//!
//! ### 1. Nodes
//!
//! A [`Node`] wraps a synchronous or async unit together with a
//! [`Signature`] naming its parameters. The executor binds each node's
//! parameters by name from the results published upstream, so a node `b`
//! with parameter `a` consumes the output of node `a`.
//!
//! ### 2. Plans
//!
//! Plans compose nodes:
//! - `x >> y` runs `y` after `x` ([`Plan::then`])
//! - `x | y` runs `x` and `y` side by side ([`Plan::alongside`])
//!
//! [`Plan::compile`] checks the composition for cycles and produces a
//! [`CompiledPlan`], which is immutable and can be shared by any number of
//! concurrent runs.
//!
//! ### 3. Generations
//!
//! [`Executor::execute`] runs the plan in generations. All steps whose
//! predecessors are done are launched together; deferred nodes run on the
//! tokio runtime while the executor waits for the whole generation. Results
//! are published to a per-run [`ResultStore`] under each node's output key.
//!
//! ## Quick Start
//!
//! ```rust
//! use edag_core::{Executor, Node, RunOptions, Signature};
//! use serde_json::{json, Map, Value};
//!
//! # tokio_test_block(async {
//! fn int(args: &Map<String, Value>, key: &str) -> i64 {
//!     args.get(key).and_then(Value::as_i64).unwrap_or(0)
//! }
//!
//! let a = Node::wrap("a", Signature::new(["start"]), |args| Ok(json!(int(&args, "start") + 1)));
//! let b = Node::wrap("b", Signature::new(["a"]), |args| Ok(json!(int(&args, "a") * 2)));
//! let c = Node::wrap("c", Signature::new(["a", "b"]), |args| {
//!     Ok(json!(int(&args, "a") + int(&args, "b")))
//! });
//!
//! // `c` needs `a` next to `b`; the pass-through forwards it.
//! let plan = &a >> (Node::pass_through() | &b) >> &c;
//! let executor = Executor::from_plan(&plan).unwrap();
//!
//! let mut seed = Map::new();
//! seed.insert("start".to_string(), json!(1));
//! let output = executor.execute(seed, RunOptions::default()).await.unwrap();
//! assert_eq!(output.results["c"], json!(6));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_multi_thread()
//! #         .enable_all()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(f)
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`binder`] - parameter signatures and binding
//! - [`node`] - node wrapping, derivations and markers
//! - [`plan`] - composition algebra and compilation
//! - [`executor`] - generation-based execution
//! - [`deferred`] - deferred node results
//! - [`store`] - per-run result storage
//! - [`config`] - executor configuration
//! - [`visualization`] - Mermaid/DOT rendering of compiled plans
//! - [`error`] - error types

pub mod binder;
pub mod config;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod node;
pub mod plan;
pub mod store;
pub mod visualization;

pub use binder::{Arguments, BindingError, Param, Signature};
pub use config::{ExecutorConfig, RunOptions};
pub use deferred::Deferred;
pub use error::{BoxError, GraphError, NodeFailure, Result, RunFailure, SharedError};
pub use executor::{Executor, RunOutput};
pub use node::{ExecutionMode, Invocation, IterSource, Node, NodeId, UnitResult};
pub use plan::{CompiledPlan, IterChain, Plan, Step};
pub use store::{InMemoryResultStore, ResultStore, StoreError};
pub use visualization::{PlanSummary, StepSummary, VisualizationFormat, VisualizationOptions};

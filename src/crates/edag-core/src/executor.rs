//! Generation-based plan execution
//!
//! The [`Executor`] runs a [`CompiledPlan`] as a sequence of generations.
//! A generation is every step whose predecessors have all completed. Each
//! generation goes through two phases:
//!
//! 1. **Launch**: every step of the generation is invoked. Inline nodes run in
//!    place, deferred nodes are spawned onto the tokio runtime, iterator
//!    chains are prepared.
//! 2. **Resolve**: all launched work is awaited together; results are then
//!    published to the run's result store in plan order.
//!
//! Nothing of a generation is published until all of it has resolved, so the
//! next generation always sees a complete previous one.
//!
//! # Visibility
//!
//! By default a step sees what its direct predecessors published in the
//! previous generation. Seed arguments stay visible in every generation to
//! the parameters that declare them; only root steps receive every seed,
//! so an open-ended node further down the graph gets exactly what its
//! predecessors published. Values from further upstream are hidden; forward
//! them with [`Node::pass_through`] or run with [`RunOptions::unrestricted`],
//! which exposes the whole result store.
//!
//! # Example
//!
//! ```rust
//! use edag_core::{Executor, Node, RunOptions, Signature};
//! use serde_json::{json, Map};
//!
//! # tokio_test_block(async {
//! let a = Node::wrap("a", Signature::new(["start"]), |args| {
//!     Ok(json!(args["start"].as_i64().unwrap_or(0) + 1))
//! });
//! let b = Node::wrap("b", Signature::new(["a"]), |args| {
//!     Ok(json!(args["a"].as_i64().unwrap_or(0) * 2))
//! });
//!
//! let executor = Executor::from_plan(&(&a >> &b)).unwrap();
//! let mut seed = Map::new();
//! seed.insert("start".to_string(), json!(1));
//!
//! let output = executor.execute(seed, RunOptions::default()).await.unwrap();
//! assert_eq!(output.results["b"], json!(4));
//! assert_eq!(output.generations, vec![vec!["start"], vec!["a"], vec!["b"]]);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_multi_thread()
//! #         .enable_all()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(f)
//! # }
//! ```

use crate::binder::{Arguments, BindingError};
use crate::config::{ExecutorConfig, RunOptions};
use crate::error::{GraphError, NodeFailure, Result, RunFailure};
use crate::node::{Invocation, Node};
use crate::plan::{CompiledPlan, IterChain, Plan, Step};
use crate::store::{InMemoryResultStore, ResultStore, StoreError};
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Every entry of the run's store, seeds included
    pub results: Map<String, Value>,
    /// Names of the nodes of each generation; generation 0 holds the seed keys
    pub generations: Vec<Vec<String>>,
}

impl RunOutput {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }
}

/// What one step published, and when.
struct Published {
    generation: usize,
    entries: Map<String, Value>,
}

struct RunState {
    id: Uuid,
    options: RunOptions,
    seeds: Arguments,
    published: Vec<Option<Published>>,
    generations: Vec<Vec<String>>,
    generation: usize,
}

impl RunState {
    fn new(seeds: Arguments, options: RunOptions, steps: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            options,
            seeds,
            published: (0..steps).map(|_| None).collect(),
            generations: Vec::new(),
            generation: 0,
        }
    }
}

/// Runs a compiled plan against a result store
///
/// Cheap to clone; clones share the plan, the store and the concurrency
/// limit, so one executor can serve concurrent runs.
#[derive(Clone)]
pub struct Executor {
    plan: Arc<CompiledPlan>,
    store: Arc<dyn ResultStore>,
    config: ExecutorConfig,
    limiter: Option<Arc<Semaphore>>,
}

impl Executor {
    pub fn new(plan: impl Into<Arc<CompiledPlan>>) -> Self {
        Self {
            plan: plan.into(),
            store: Arc::new(InMemoryResultStore::new()),
            config: ExecutorConfig::default(),
            limiter: None,
        }
    }

    /// Compile `plan` and wrap it.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        Ok(Self::new(plan.compile()?))
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        self.limiter = config.max_concurrency.map(|limit| Arc::new(Semaphore::new(limit)));
        self.config = config;
        Ok(self)
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run with the options of the executor's configuration.
    pub async fn run(&self, seed: Arguments) -> std::result::Result<RunOutput, RunFailure> {
        self.execute(seed, self.config.run_options()).await
    }

    /// Run the plan once.
    ///
    /// The first failing step aborts the run. Deferred work already spawned
    /// for the failing generation is detached, and nothing of that
    /// generation is published. The run's store entries are purged on both
    /// outcomes unless `options.retain_results` is set.
    #[tracing::instrument(
        skip(self, seed),
        fields(steps = self.plan.len(), run_id = tracing::field::Empty)
    )]
    pub async fn execute(
        &self,
        seed: Arguments,
        options: RunOptions,
    ) -> std::result::Result<RunOutput, RunFailure> {
        let started_at = Utc::now();
        let mut run = RunState::new(seed, options, self.plan.len());
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        tracing::info!(unrestricted = options.unrestricted, "Starting run");

        let outcome = match self.drive(&mut run).await {
            Ok(()) => self.store.entries(run.id).await.map_err(GraphError::from),
            Err(e) => Err(e),
        };

        if !options.retain_results {
            if let Err(e) = self.store.purge(run.id).await {
                tracing::warn!(error = %e, "Failed to purge run results");
            }
        }

        match outcome {
            Ok(results) => {
                tracing::info!(generations = run.generations.len(), "Run completed");
                Ok(RunOutput {
                    run_id: run.id,
                    started_at,
                    finished_at: Utc::now(),
                    results,
                    generations: run.generations,
                })
            }
            Err(error) => {
                tracing::error!(error = %error, generation = run.generation, "Run failed");
                Err(RunFailure {
                    run_id: run.id,
                    generation: run.generation,
                    generations: run.generations,
                    error,
                })
            }
        }
    }

    async fn drive(&self, run: &mut RunState) -> Result<()> {
        for (key, value) in &run.seeds {
            self.store.put(run.id, key, value.clone()).await?;
        }
        run.generations.push(run.seeds.keys().cloned().collect());

        let plan = &*self.plan;
        let mut in_degree: Vec<usize> = (0..plan.len())
            .map(|step| plan.predecessors(step).len())
            .collect();
        let mut ready: Vec<usize> = (0..plan.len())
            .filter(|&step| in_degree[step] == 0)
            .collect();

        while !ready.is_empty() {
            run.generation += 1;
            tracing::debug!(
                generation = run.generation,
                steps = ready.len(),
                "Starting generation"
            );

            let mut launched = Vec::with_capacity(ready.len());
            for &step in &ready {
                launched.push(self.launch(run, step).await?);
            }
            let values = future::join_all(launched)
                .await
                .into_iter()
                .collect::<Result<Vec<Value>>>()?;
            self.publish(run, &ready, values).await?;

            let mut next = Vec::new();
            for &step in &ready {
                for &succ in plan.successors(step) {
                    in_degree[succ] -= 1;
                    if in_degree[succ] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort_unstable();
            ready = next;
        }
        Ok(())
    }

    /// Phase one for a single step.
    async fn launch(
        &self,
        run: &RunState,
        step: usize,
    ) -> Result<BoxFuture<'static, Result<Value>>> {
        let (run_id, generation) = (run.id, run.generation);

        match &self.plan.steps()[step] {
            Step::Node(node) => {
                let inputs = if node.is_pass_through() {
                    self.upstream(run, step)
                } else {
                    self.visible_inputs(run, step).await?
                };
                tracing::debug!(node = node.name(), inline = node.is_inline(), "Launching step");

                let name = node.name().to_string();
                match node.execute_limited(inputs, self.limiter.clone()).await {
                    Ok(Invocation::Ready(value)) => {
                        Ok(future::ready(Ok::<_, GraphError>(value)).boxed())
                    }
                    Ok(Invocation::Deferred(deferred)) => {
                        deferred.start();
                        Ok(async move {
                            deferred
                                .resolve()
                                .await
                                .map_err(|failure| {
                                    failure.into_graph_error(name, run_id, generation)
                                })
                        }
                        .boxed())
                    }
                    Err(failure) => Err(failure.into_graph_error(name, run_id, generation)),
                }
            }
            Step::Chain(chain) => {
                let inputs = self.visible_inputs(run, step).await?;
                let elements = sequence_input(chain, &inputs, run_id, generation)?;
                tracing::debug!(
                    chain = %self.plan.steps()[step].label(),
                    elements = elements.len(),
                    "Launching iterator chain"
                );

                let chain = ChainRun {
                    nodes: chain.nodes().to_vec(),
                    over: chain.over().to_string(),
                    base: inputs,
                    seeds: (!run.options.unrestricted).then(|| run.seeds.clone()),
                    limiter: self.limiter.clone(),
                    run_id,
                    generation,
                };
                Ok(chain.run(elements).boxed())
            }
        }
    }

    async fn visible_inputs(&self, run: &RunState, step: usize) -> Result<Arguments> {
        if run.options.unrestricted {
            return Ok(self.store.entries(run.id).await?);
        }
        let mut inputs = self.seeds_for(run, step);
        inputs.extend(self.upstream(run, step));
        Ok(inputs)
    }

    /// Seeds a restricted step receives. Root steps get all of them; any
    /// other step only the keys its head declares or iterates over.
    fn seeds_for(&self, run: &RunState, step: usize) -> Arguments {
        if self.plan.predecessors(step).is_empty() {
            return run.seeds.clone();
        }
        match &self.plan.steps()[step] {
            Step::Node(node) => declared_seeds(&run.seeds, node, None),
            Step::Chain(chain) => declared_seeds(&run.seeds, &chain.nodes()[0], Some(chain.over())),
        }
    }

    /// Entries published by the step's direct predecessors; restricted runs
    /// only see those of the previous generation.
    fn upstream(&self, run: &RunState, step: usize) -> Arguments {
        self.plan
            .predecessors(step)
            .iter()
            .filter_map(|&pred| run.published[pred].as_ref())
            .filter(|published| {
                run.options.unrestricted || published.generation + 1 == run.generation
            })
            .flat_map(|published| published.entries.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Phase two output: store the generation's results in plan order.
    async fn publish(&self, run: &mut RunState, steps: &[usize], values: Vec<Value>) -> Result<()> {
        let mut staged = Vec::with_capacity(steps.len());
        for (&step, value) in steps.iter().zip(values) {
            let publisher = match &self.plan.steps()[step] {
                Step::Node(node) => node,
                Step::Chain(chain) => chain.terminal(),
            };
            staged.push((step, publisher, output_entries(publisher, value)?));
        }

        let mut owners: HashMap<String, &str> = HashMap::new();
        let mut names = Vec::new();
        for (step, publisher, entries) in staged {
            for (key, value) in &entries {
                if let Some(previous) = owners.insert(key.clone(), publisher.name()) {
                    tracing::warn!(
                        key = %key,
                        first = previous,
                        second = publisher.name(),
                        "Output key published twice in one generation"
                    );
                }
                self.store.put(run.id, key, value.clone()).await?;
            }
            names.extend(self.plan.steps()[step].node_names());
            run.published[step] = Some(Published {
                generation: run.generation,
                entries,
            });
        }

        tracing::debug!(generation = run.generation, nodes = ?names, "Generation complete");
        run.generations.push(names);
        Ok(())
    }

    /// Ids of runs whose results are still held by the store.
    pub async fn retained_runs(&self) -> Result<Vec<Uuid>> {
        Ok(self.store.runs().await?)
    }

    pub async fn run_results(&self, run_id: Uuid) -> Result<Map<String, Value>> {
        let entries = self.store.entries(run_id).await?;
        if entries.is_empty() {
            return Err(StoreError::RunNotFound(run_id).into());
        }
        Ok(entries)
    }

    /// Drop a retained run. Returns whether anything was held for it.
    pub async fn discard_run(&self, run_id: Uuid) -> Result<bool> {
        Ok(self.store.purge(run_id).await? > 0)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("steps", &self.plan.len())
            .field("config", &self.config)
            .finish()
    }
}

fn output_entries(node: &Node, value: Value) -> Result<Map<String, Value>> {
    if !node.is_exploded() {
        let mut entries = Map::new();
        entries.insert(node.output_key().to_string(), value);
        return Ok(entries);
    }
    match value {
        Value::Object(entries) => Ok(entries),
        other => Err(GraphError::InvalidOutput {
            node: node.name().to_string(),
            reason: format!("an exploded result must be an object, got {}", kind(&other)),
        }),
    }
}

fn declared_seeds(seeds: &Arguments, node: &Node, iterated: Option<&str>) -> Arguments {
    seeds
        .iter()
        .filter(|(key, _)| node.signature().declares(key) || iterated == Some(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn sequence_input(
    chain: &IterChain,
    inputs: &Arguments,
    run_id: Uuid,
    generation: usize,
) -> Result<Vec<Value>> {
    let head = chain.nodes()[0].name();
    match inputs.get(chain.over()) {
        Some(Value::Array(elements)) => Ok(elements.clone()),
        Some(other) => Err(GraphError::InvalidInput {
            node: head.to_string(),
            reason: format!("'{}' must be an array, got {}", chain.over(), kind(other)),
        }),
        None => Err(NodeFailure::from(BindingError::Missing {
            params: vec![chain.over().to_string()],
        })
        .into_graph_error(head, run_id, generation)),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One iterator chain, applied to every element of its input sequence.
struct ChainRun {
    nodes: Vec<Node>,
    over: String,
    base: Arguments,
    /// Set for restricted runs: later links see the seeds they declare and
    /// their predecessor's value only.
    seeds: Option<Arguments>,
    limiter: Option<Arc<Semaphore>>,
    run_id: Uuid,
    generation: usize,
}

impl ChainRun {
    async fn run(self, elements: Vec<Value>) -> Result<Value> {
        let results =
            future::try_join_all(elements.into_iter().map(|element| self.apply(element))).await?;
        Ok(Value::Array(results))
    }

    async fn apply(&self, element: Value) -> Result<Value> {
        let mut inputs = self.base.clone();
        inputs.insert(self.over.clone(), element);

        let mut value = self.call(&self.nodes[0], inputs.clone()).await?;
        for link in self.nodes.windows(2) {
            let (prev, node) = (&link[0], &link[1]);
            if let Some(seeds) = &self.seeds {
                inputs = declared_seeds(seeds, node, None);
            }
            inputs.insert(prev.output_key().to_string(), value);
            value = self.call(node, inputs.clone()).await?;
        }
        Ok(value)
    }

    async fn call(&self, node: &Node, inputs: Arguments) -> Result<Value> {
        let outcome = match node.execute_limited(inputs, self.limiter.clone()).await {
            Ok(invocation) => invocation.resolve().await,
            Err(failure) => Err(failure),
        };
        outcome.map_err(|failure| {
            failure.into_graph_error(node.name(), self.run_id, self.generation)
        })
    }
}

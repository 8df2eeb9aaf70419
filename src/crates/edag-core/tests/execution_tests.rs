//! Integration tests for plan execution
//!
//! End-to-end runs through `Plan` composition, compilation and the
//! generation-based executor.

use async_trait::async_trait;
use edag_core::{
    Arguments, BindingError, Executor, ExecutorConfig, GraphError, InMemoryResultStore, Node,
    ResultStore, RunOptions, Signature, StoreError,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn int(args: &Arguments, key: &str) -> i64 {
    args.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn seed(pairs: &[(&str, Value)]) -> Arguments {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn start_plus_one() -> Node {
    Node::wrap("a", Signature::new(["start"]), |args| Ok(json!(int(&args, "start") + 1)))
}

fn double_a() -> Node {
    Node::wrap("b", Signature::new(["a"]), |args| Ok(json!(int(&args, "a") * 2)))
}

fn sum_a_b() -> Node {
    Node::wrap("c", Signature::new(["a", "b"]), |args| {
        Ok(json!(int(&args, "a") + int(&args, "b")))
    })
}

fn missing_params(error: &GraphError) -> Option<(&str, Vec<String>)> {
    match error {
        GraphError::Binding {
            node,
            source: BindingError::Missing { params },
            ..
        } => Some((node.as_str(), params.clone())),
        _ => None,
    }
}

/// Store whose writes of one key fail, as a remote backend might.
struct FlakyStore {
    inner: InMemoryResultStore,
    broken_key: &'static str,
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn get(&self, run_id: Uuid, key: &str) -> edag_core::store::Result<Option<Value>> {
        self.inner.get(run_id, key).await
    }

    async fn put(&self, run_id: Uuid, key: &str, value: Value) -> edag_core::store::Result<()> {
        if key == self.broken_key {
            return Err(StoreError::Io("connection reset".to_string()));
        }
        self.inner.put(run_id, key, value).await
    }

    async fn delete(&self, run_id: Uuid, key: &str) -> edag_core::store::Result<bool> {
        self.inner.delete(run_id, key).await
    }

    async fn entries(&self, run_id: Uuid) -> edag_core::store::Result<Map<String, Value>> {
        self.inner.entries(run_id).await
    }

    async fn purge(&self, run_id: Uuid) -> edag_core::store::Result<usize> {
        self.inner.purge(run_id).await
    }

    async fn runs(&self) -> edag_core::store::Result<Vec<Uuid>> {
        self.inner.runs().await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_linear_three_nodes() {
    let c = Node::wrap("c", Signature::new(["b"]), |args| Ok(json!(int(&args, "b") - 3)));
    let executor = Executor::from_plan(&(start_plus_one() >> double_a() >> c)).unwrap();

    let output = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(output.results["a"], json!(2));
    assert_eq!(output.results["b"], json!(4));
    assert_eq!(output.results["c"], json!(1));
    assert_eq!(output.generations, vec![vec!["start"], vec!["a"], vec!["b"], vec!["c"]]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restricted_visibility_hides_indirect_results() {
    let executor = Executor::from_plan(&(start_plus_one() >> double_a() >> sum_a_b())).unwrap();

    let failure = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(failure.generation, 3);
    assert_eq!(failure.generations, vec![vec!["start"], vec!["a"], vec!["b"]]);
    match &failure.error {
        GraphError::Binding { node, source, .. } => {
            assert_eq!(node, "c");
            assert_eq!(source.to_string(), "missing required parameter(s): a");
        }
        other => panic!("expected a binding error, got {:?}", other),
    }

    let output = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::new().unrestricted())
        .await
        .unwrap();
    assert_eq!(output.results["c"], json!(6));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declared_seed_stays_visible_downstream() {
    let b = Node::wrap("b", Signature::new(["a", "start"]), |args| {
        Ok(json!(int(&args, "a") + int(&args, "start")))
    });
    let executor = Executor::from_plan(&(start_plus_one() >> b)).unwrap();

    let output = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(output.results["b"], json!(3));
    assert_eq!(output.generations[2], vec!["b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restricted_visibility_hides_a_skipped_generation() {
    let (a, b, c) = (start_plus_one(), double_a(), sum_a_b());
    let executor = Executor::from_plan(&((&a >> &b >> &c) | (&a >> &c))).unwrap();

    let failure = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failure.generation, 3);
    assert_eq!(missing_params(&failure.error), Some(("c", vec!["a".to_string()])));

    let output = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::new().unrestricted())
        .await
        .unwrap();
    assert_eq!(output.results["c"], json!(6));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pass_through_forwards_upstream_results() {
    let plan = start_plus_one() >> (Node::pass_through() | double_a()) >> sum_a_b();
    let executor = Executor::from_plan(&plan).unwrap();

    let output = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(output.results["c"], json!(6));
    assert_eq!(output.generations[2], vec!["pass_through", "b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explode_fans_out_to_open_ended_consumer() {
    let generate = Node::wrap("generate_items", Signature::new(["n"]), |args| {
        let items: Map<String, Value> = (0..int(&args, "n"))
            .map(|val| (format!("item_{}", val), json!(val)))
            .collect();
        Ok(Value::Object(items))
    });
    let sum = Node::wrap("sum_items", Signature::variadic(), |args| {
        Ok(json!(args.values().filter_map(Value::as_i64).sum::<i64>()))
    });

    let executor = Executor::from_plan(&(!&generate >> &sum)).unwrap();
    let output = executor
        .execute(seed(&[("n", json!(3))]), RunOptions::default())
        .await
        .unwrap();

    // The seed `n` is not among the consumer's inputs.
    assert_eq!(output.results["sum_items"], json!(3));
    assert_eq!(output.results["item_2"], json!(2));
    assert_eq!(output.results["n"], json!(3));
    assert!(output.results.get("generate_items").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_iterator_preserves_order() {
    let numbers = Node::wrap("numbers", Signature::new(["count"]), |args| {
        Ok(json!((1..=int(&args, "count")).collect::<Vec<i64>>()))
    });
    let square = Node::wrap_async("square", Signature::new(["numbers"]), |args| async move {
        let n = int(&args, "numbers");
        // Later elements finish first.
        tokio::time::sleep(Duration::from_millis((10 - n as u64) * 5)).await;
        Ok(json!(n * n))
    })
    .iterate();

    let executor = Executor::from_plan(&(&numbers >> &square)).unwrap();
    let output = executor
        .execute(seed(&[("count", json!(5))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(output.results["square"], json!([1, 4, 9, 16, 25]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_iterator_chain_applies_both_per_element() {
    let numbers = Node::wrap("numbers", Signature::variadic(), |_| Ok(json!([1, 2, 3])));
    let square = Node::wrap("square", Signature::new(["numbers"]), |args| {
        let n = int(&args, "numbers");
        Ok(json!(n * n))
    })
    .iterate();
    let inc = Node::wrap("inc", Signature::new(["square"]), |args| {
        Ok(json!(int(&args, "square") + 1))
    })
    .iterate();
    let total = Node::wrap("total", Signature::new(["inc"]), |args| {
        let items = args.get("inc").and_then(Value::as_array).ok_or("inc must be an array")?;
        Ok(json!(items.iter().filter_map(Value::as_i64).sum::<i64>()))
    });

    let executor = Executor::from_plan(&(&numbers >> &square >> &inc >> &total)).unwrap();
    let output = executor.execute(Arguments::new(), RunOptions::default()).await.unwrap();

    assert_eq!(output.results["inc"], json!([2, 5, 10]));
    assert_eq!(output.results["total"], json!(17));
    assert!(output.results.get("square").is_none());
    assert_eq!(output.generations[2], vec!["square", "inc"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_iterator_chain_visibility_follows_run_mode() {
    let numbers = Node::wrap("numbers", Signature::variadic(), |_| Ok(json!([1, 2, 3])));
    let bias = Node::wrap("bias", Signature::variadic(), |_| Ok(json!(10)));
    let square = Node::wrap("square", Signature::new(["numbers"]), |args| {
        let n = int(&args, "numbers");
        Ok(json!(n * n))
    });
    let shift = Node::wrap("shift", Signature::new(["square", "bias"]), |args| {
        Ok(json!(int(&args, "square") + int(&args, "bias")))
    })
    .iterate();

    // `bias` is a sibling result: only unrestricted runs pass it along the chain.
    let plan = (&numbers | &bias) >> square.iterate_over("numbers") >> &shift;
    let executor = Executor::from_plan(&plan).unwrap();

    let output = executor
        .execute(Arguments::new(), RunOptions::new().unrestricted())
        .await
        .unwrap();
    assert_eq!(output.results["shift"], json!([11, 14, 19]));

    let failure = executor
        .execute(Arguments::new(), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(missing_params(&failure.error), Some(("shift", vec!["bias".to_string()])));

    // A seed the later link declares does reach it in a restricted run.
    let executor = Executor::from_plan(&(&numbers >> square.iterate() >> &shift)).unwrap();
    let output = executor
        .execute(seed(&[("bias", json!(10))]), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(output.results["shift"], json!([11, 14, 19]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deferred_nodes_of_a_generation_overlap() {
    let sleeper = |name: &str| {
        Node::wrap_async(name, Signature::variadic(), |_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!("done"))
        })
    };
    let plan = sleeper("first") | sleeper("second") | sleeper("third");
    let executor = Executor::from_plan(&plan).unwrap();

    let started = Instant::now();
    let output = executor.execute(Arguments::new(), RunOptions::default()).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(800));
    assert_eq!(output.generations[1], vec!["first", "second", "third"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_max_concurrency_serializes_deferred_work() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tracked = |name: &str| {
        let (running, peak) = (running.clone(), peak.clone());
        Node::wrap_async(name, Signature::variadic(), move |_| {
            let (running, peak) = (running.clone(), peak.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        })
    };
    let plan = tracked("a") | tracked("b") | tracked("c") | tracked("d");
    let executor = Executor::from_plan(&plan)
        .unwrap()
        .with_config(ExecutorConfig::new().with_max_concurrency(1))
        .unwrap();

    executor.run(Arguments::new()).await.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_keeps_original_error_and_trace() {
    let broken = Node::wrap("broken", Signature::new(["a"]), |_| Err("disk full".into()));
    let store = Arc::new(InMemoryResultStore::new());
    let executor = Executor::from_plan(&(start_plus_one() >> broken))
        .unwrap()
        .with_store(store.clone());

    let failure = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(failure.generation, 2);
    assert_eq!(failure.generations, vec![vec!["start"], vec!["a"]]);
    assert!(matches!(
        failure.error,
        GraphError::NodeExecution { ref node, .. } if node == "broken"
    ));
    assert_eq!(
        std::error::Error::source(&failure.error).map(|e| e.to_string()),
        Some("disk full".to_string())
    );
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_failure_aborts_the_run() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryResultStore::new(),
        broken_key: "b",
    });
    let executor = Executor::from_plan(&(start_plus_one() >> double_a()))
        .unwrap()
        .with_store(store.clone());

    let failure = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(failure.generation, 2);
    assert_eq!(failure.generations, vec![vec!["start"], vec!["a"]]);
    assert!(matches!(
        failure.error,
        GraphError::Store(StoreError::Io(ref reason)) if reason == "connection reset"
    ));
    assert!(store.inner.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retained_runs_can_be_inspected_and_discarded() {
    let executor = Executor::from_plan(&(start_plus_one() >> double_a())).unwrap();

    let kept = executor
        .execute(seed(&[("start", json!(1))]), RunOptions::new().retain())
        .await
        .unwrap();
    let dropped = executor
        .execute(seed(&[("start", json!(2))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(executor.retained_runs().await.unwrap(), vec![kept.run_id]);
    assert_eq!(executor.run_results(kept.run_id).await.unwrap()["b"], json!(4));
    assert!(executor.run_results(dropped.run_id).await.is_err());

    assert!(executor.discard_run(kept.run_id).await.unwrap());
    assert!(!executor.discard_run(kept.run_id).await.unwrap());
    assert!(executor.retained_runs().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_runs_share_one_plan() {
    let store = Arc::new(InMemoryResultStore::new());
    let executor = Executor::from_plan(&(start_plus_one() >> double_a()))
        .unwrap()
        .with_store(store.clone());

    let runs = (0..8).map(|start| {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .execute(seed(&[("start", json!(start))]), RunOptions::new().retain())
                .await
        })
    });
    let outputs = futures::future::join_all(runs).await;

    for (start, output) in outputs.into_iter().enumerate() {
        let output = output.unwrap().unwrap();
        assert_eq!(output.results["b"], json!((start as i64 + 1) * 2));
        assert_eq!(
            store.get(output.run_id, "b").await.unwrap(),
            Some(json!((start as i64 + 1) * 2))
        );
    }
    assert_eq!(store.len(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clone_with_reuses_a_function() {
    let inc = Node::wrap("inc", Signature::new(["value"]), |args| {
        Ok(json!(int(&args, "value") + 1))
    });
    let first = inc.with_output("value");
    let second = first.clone_with([("unused", json!(true))]);

    let executor = Executor::from_plan(&(&first >> &second)).unwrap();
    let output = executor
        .execute(seed(&[("value", json!(10))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(output.results["value"], json!(12));
}

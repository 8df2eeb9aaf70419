//! Plan composition and compilation
//!
//! A [`Plan`] is an immutable composition of [`Node`]s. Plans are built with
//! two operators, each available as a method and as an operator overload:
//!
//! | Operation | Method | Operator | Meaning |
//! |-----------|--------|----------|---------|
//! | Sequence  | [`Plan::then`] | `x >> y` | every terminal of `x` precedes every root of `y` |
//! | Branch    | [`Plan::alongside`] | `x \| y` | siblings sharing the same predecessors |
//! | Explode   | [`Node::explode`] | `!node` | publish an object result as one entry per key |
//!
//! The other markers live on the nodes themselves: [`Node::iterate`] /
//! [`Node::iterate_over`] and [`Node::pass_through`].
//!
//! # Compilation
//!
//! [`Plan::compile`] turns the composition into a [`CompiledPlan`], the
//! predecessor map the executor schedules from:
//!
//! ```text
//!   a >> (pass_through | b) >> c
//!
//!   a ──┬──> pass_through ──┬──> c
//!       └──> b ─────────────┘
//!
//!   c: {pass_through, b}   pass_through: {a}   b: {a}   a: {}
//! ```
//!
//! Nodes are vertices by identity, so composing the same node twice refers to
//! one vertex. A composition that closes a loop (`a >> b >> a`) fails with
//! [`GraphError::Cycle`].
//!
//! A run of iterator-marked nodes where each link has exactly one
//! predecessor and one successor is fused into a single chain step, applied
//! elementwise without materializing the intermediate sequences.
//!
//! ```rust
//! use edag_core::{Node, Signature};
//! use serde_json::{json, Value};
//!
//! let a = Node::wrap("a", Signature::new(["start"]), |args| {
//!     Ok(json!(args["start"].as_i64().unwrap_or(0) + 1))
//! });
//! let b = Node::wrap("b", Signature::new(["a"]), |args| {
//!     Ok(json!(args["a"].as_i64().unwrap_or(0) * 2))
//! });
//!
//! let compiled = (&a >> &b).compile().unwrap();
//! assert_eq!(compiled.len(), 2);
//! assert!(compiled.predecessor_map()[&b.id()].contains(&a.id()));
//!
//! assert!((&a >> &b >> &a).compile().is_err());
//! ```

use crate::error::{GraphError, Result};
use crate::node::{IterSource, Node, NodeId};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::{BitOr, Not, Shr};

/// Immutable composition of nodes
#[derive(Debug, Clone, Default)]
pub struct Plan {
    nodes: Vec<Node>,
    edges: Vec<(NodeId, NodeId)>,
    roots: Vec<NodeId>,
    terminals: Vec<NodeId>,
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl Plan {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Lift a node (or return a plan unchanged).
    pub fn as_plan(item: impl Into<Plan>) -> Self {
        item.into()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[(NodeId, NodeId)] {
        &self.edges
    }

    /// Vertices a following plan is attached to by [`Plan::then`].
    pub fn terminals(&self) -> &[NodeId] {
        &self.terminals
    }

    /// Vertices a preceding plan attaches to.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.id() == id)
    }

    fn absorb(&mut self, other: Plan) {
        for node in other.nodes {
            if !self.contains(node.id()) {
                self.nodes.push(node);
            }
        }
        for edge in other.edges {
            push_unique(&mut self.edges, edge);
        }
    }

    /// Sequence: every terminal of `self` precedes every root of `next`.
    pub fn then(self, next: impl Into<Plan>) -> Plan {
        let next = next.into();
        if self.is_empty() {
            return next;
        }
        if next.is_empty() {
            return self;
        }

        let links: Vec<(NodeId, NodeId)> = self
            .terminals
            .iter()
            .flat_map(|from| next.roots.iter().map(move |to| (*from, *to)))
            .collect();
        let roots = self.roots.clone();
        let terminals = next.terminals.clone();

        let mut plan = self;
        plan.absorb(next);
        for edge in links {
            push_unique(&mut plan.edges, edge);
        }
        plan.roots = roots;
        plan.terminals = terminals;
        plan
    }

    /// Branch: `self` and `other` side by side, no edge between them.
    pub fn alongside(self, other: impl Into<Plan>) -> Plan {
        let other = other.into();
        let roots = other.roots.clone();
        let terminals = other.terminals.clone();

        let mut plan = self;
        plan.absorb(other);
        for id in roots {
            push_unique(&mut plan.roots, id);
        }
        for id in terminals {
            push_unique(&mut plan.terminals, id);
        }
        plan
    }

    /// Compile into a predecessor map.
    ///
    /// Fails with [`GraphError::Cycle`] when the composition is cyclic and
    /// with [`GraphError::Validation`] when it is empty or its markers cannot
    /// be honoured.
    pub fn compile(&self) -> Result<CompiledPlan> {
        if self.nodes.is_empty() {
            return Err(GraphError::validation("plan has no nodes"));
        }

        let index: HashMap<NodeId, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id(), i))
            .collect();

        let count = self.nodes.len();
        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut succs: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        for (from, to) in &self.edges {
            let (Some(&from), Some(&to)) = (index.get(from), index.get(to)) else {
                return Err(GraphError::validation("edge refers to a node outside the plan"));
            };
            preds[to].insert(from);
            succs[from].insert(to);
        }

        check_acyclic(&self.nodes, &preds, &succs)?;
        self.check_markers()?;

        // Chain membership: position of the chain head for every fused node.
        let mut head_of: Vec<Option<usize>> = vec![None; count];
        let mut chains: HashMap<usize, IterChain> = HashMap::new();
        for i in 0..count {
            if self.nodes[i].iterator().is_none() || self.chain_link(i, &preds, &succs).is_some() {
                continue;
            }
            let over = self.iterated_key(i, &preds)?;
            let mut members = vec![i];
            let mut current = i;
            while let Some(&next) = succs[current].iter().next() {
                if succs[current].len() != 1
                    || self.chain_link(next, &preds, &succs) != Some(current)
                {
                    break;
                }
                members.push(next);
                current = next;
            }
            for &member in &members {
                head_of[member] = Some(i);
            }
            chains.insert(
                i,
                IterChain {
                    nodes: members.iter().map(|&m| self.nodes[m].clone()).collect(),
                    over,
                },
            );
        }

        let mut steps = Vec::new();
        let mut step_of = vec![0usize; count];
        let mut head_step: HashMap<usize, usize> = HashMap::new();
        for i in 0..count {
            match head_of[i] {
                Some(head) if head == i => {
                    let chain = chains.remove(&i).ok_or_else(|| {
                        GraphError::validation("iterator chain lost during compilation")
                    })?;
                    head_step.insert(i, steps.len());
                    step_of[i] = steps.len();
                    steps.push(Step::Chain(chain));
                }
                Some(_) => {}
                None => {
                    step_of[i] = steps.len();
                    steps.push(Step::Node(self.nodes[i].clone()));
                }
            }
        }
        for i in 0..count {
            if let Some(head) = head_of[i] {
                step_of[i] = head_step[&head];
            }
        }

        let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
        for (to, from_set) in preds.iter().enumerate() {
            for &from in from_set {
                let (from_step, to_step) = (step_of[from], step_of[to]);
                if from_step != to_step {
                    predecessors[to_step].insert(from_step);
                    successors[from_step].insert(to_step);
                }
            }
        }

        let node_predecessors: HashMap<NodeId, HashSet<NodeId>> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id(), preds[i].iter().map(|&p| self.nodes[p].id()).collect()))
            .collect();

        tracing::debug!(nodes = count, steps = steps.len(), "Compiled plan");

        Ok(CompiledPlan {
            steps,
            predecessors,
            successors,
            node_predecessors,
        })
    }

    fn check_markers(&self) -> Result<()> {
        for node in &self.nodes {
            if node.iterator().is_none() {
                continue;
            }
            if node.is_pass_through() {
                return Err(GraphError::validation("a pass-through cannot be iterator-marked"));
            }
            if node.is_exploded() {
                return Err(GraphError::validation(format!(
                    "node '{}' cannot be both exploded and iterator-marked",
                    node.name()
                )));
            }
        }
        Ok(())
    }

    /// The iterator node `i` continues a chain from, if any.
    fn chain_link(
        &self,
        i: usize,
        preds: &[BTreeSet<usize>],
        succs: &[BTreeSet<usize>],
    ) -> Option<usize> {
        if self.nodes[i].iterator() != Some(&IterSource::Upstream) || preds[i].len() != 1 {
            return None;
        }
        let prev = *preds[i].iter().next()?;
        (self.nodes[prev].iterator().is_some() && succs[prev].len() == 1).then_some(prev)
    }

    fn iterated_key(&self, head: usize, preds: &[BTreeSet<usize>]) -> Result<String> {
        let node = &self.nodes[head];
        if let Some(IterSource::Key(key)) = node.iterator() {
            return Ok(key.clone());
        }

        let mut upstream = preds[head].iter().map(|&p| &self.nodes[p]);
        match (upstream.next(), upstream.next()) {
            (Some(pred), None) if !pred.is_exploded() => Ok(pred.output_key().to_string()),
            _ => Err(GraphError::validation(format!(
                "cannot infer the iterated input of '{}'; use iterate_over",
                node.name()
            ))),
        }
    }
}

fn check_acyclic(
    nodes: &[Node],
    preds: &[BTreeSet<usize>],
    succs: &[BTreeSet<usize>],
) -> Result<()> {
    let mut in_degree: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;

    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &next in &succs[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited == nodes.len() {
        return Ok(());
    }

    let cyclic = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] > 0)
        .map(|(_, n)| n.name().to_string())
        .collect();
    Err(GraphError::Cycle { nodes: cyclic })
}

impl From<Node> for Plan {
    fn from(node: Node) -> Self {
        let id = node.id();
        Self {
            nodes: vec![node],
            edges: Vec::new(),
            roots: vec![id],
            terminals: vec![id],
        }
    }
}

impl From<&Node> for Plan {
    fn from(node: &Node) -> Self {
        Plan::from(node.clone())
    }
}

impl From<&Plan> for Plan {
    fn from(plan: &Plan) -> Self {
        plan.clone()
    }
}

impl<T: Into<Plan>> Shr<T> for Plan {
    type Output = Plan;

    fn shr(self, rhs: T) -> Plan {
        self.then(rhs)
    }
}

impl<T: Into<Plan>> Shr<T> for Node {
    type Output = Plan;

    fn shr(self, rhs: T) -> Plan {
        Plan::from(self).then(rhs)
    }
}

impl<T: Into<Plan>> Shr<T> for &Node {
    type Output = Plan;

    fn shr(self, rhs: T) -> Plan {
        Plan::from(self).then(rhs)
    }
}

impl<T: Into<Plan>> BitOr<T> for Plan {
    type Output = Plan;

    fn bitor(self, rhs: T) -> Plan {
        self.alongside(rhs)
    }
}

impl<T: Into<Plan>> BitOr<T> for Node {
    type Output = Plan;

    fn bitor(self, rhs: T) -> Plan {
        Plan::from(self).alongside(rhs)
    }
}

impl<T: Into<Plan>> BitOr<T> for &Node {
    type Output = Plan;

    fn bitor(self, rhs: T) -> Plan {
        Plan::from(self).alongside(rhs)
    }
}

impl Not for Node {
    type Output = Node;

    fn not(self) -> Node {
        self.explode()
    }
}

impl Not for &Node {
    type Output = Node;

    fn not(self) -> Node {
        self.explode()
    }
}

/// Contiguous iterator-marked nodes applied elementwise as one step
#[derive(Debug, Clone)]
pub struct IterChain {
    nodes: Vec<Node>,
    over: String,
}

impl IterChain {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Input key holding the sequence the chain iterates over.
    pub fn over(&self) -> &str {
        &self.over
    }

    /// Node whose per-element results are collected.
    pub fn terminal(&self) -> &Node {
        // A chain always has its head.
        &self.nodes[self.nodes.len() - 1]
    }
}

/// One schedulable entry of a compiled plan
#[derive(Debug, Clone)]
pub enum Step {
    Node(Node),
    Chain(IterChain),
}

impl Step {
    pub fn nodes(&self) -> &[Node] {
        match self {
            Step::Node(node) => std::slice::from_ref(node),
            Step::Chain(chain) => chain.nodes(),
        }
    }

    /// Names recorded in the generation trace.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes().iter().map(|n| n.name().to_string()).collect()
    }

    pub fn label(&self) -> String {
        self.node_names().join(" >> ")
    }
}

/// Compiled predecessor map
///
/// Immutable once built; share it behind an `Arc` to run it concurrently.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    steps: Vec<Step>,
    predecessors: Vec<BTreeSet<usize>>,
    successors: Vec<BTreeSet<usize>>,
    node_predecessors: HashMap<NodeId, HashSet<NodeId>>,
}

impl CompiledPlan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Direct predecessor steps of `step`.
    pub fn predecessors(&self, step: usize) -> &BTreeSet<usize> {
        &self.predecessors[step]
    }

    pub fn successors(&self, step: usize) -> &BTreeSet<usize> {
        &self.successors[step]
    }

    /// Node-level view: node id to the ids of its direct predecessors.
    pub fn predecessor_map(&self) -> &HashMap<NodeId, HashSet<NodeId>> {
        &self.node_predecessors
    }

    /// Generations the executor will form, by node name.
    pub fn planned_generations(&self) -> Vec<Vec<String>> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: Vec<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut generations = Vec::new();

        while !ready.is_empty() {
            let mut next = Vec::new();
            let mut names = Vec::new();
            for &step in &ready {
                names.extend(self.steps[step].node_names());
                for &succ in &self.successors[step] {
                    in_degree[succ] -= 1;
                    if in_degree[succ] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort_unstable();
            generations.push(names);
            ready = next;
        }
        generations
    }
}

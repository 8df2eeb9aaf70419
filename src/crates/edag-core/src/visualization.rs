//! Plan visualization
//!
//! Renders a [`CompiledPlan`] as text for documentation and debugging:
//! - **Mermaid** - renders natively in GitHub/GitLab markdown
//! - **DOT** - Graphviz input (`dot -Tpng plan.dot -o plan.png`)
//!
//! Each step is one diagram node: a plain node, a pass-through (circle) or a
//! fused iterator chain (labelled `head >> ... >> terminal`).
//!
//! ```rust
//! use edag_core::{Node, Signature};
//! use edag_core::visualization::VisualizationOptions;
//! use serde_json::json;
//!
//! let a = Node::wrap("load", Signature::variadic(), |_| Ok(json!([1, 2, 3])));
//! let b = Node::wrap("square", Signature::new(["load"]), |args| Ok(args["load"].clone()))
//!     .iterate();
//!
//! let compiled = (&a >> &b).compile().unwrap();
//! let mermaid = compiled.visualize(&VisualizationOptions::mermaid().with_title("Squares"));
//! assert!(mermaid.contains("s0 --> s1"));
//! ```
//!
//! [`CompiledPlan::summary`] gives the same structure as a serializable
//! value, for hosts that render plans themselves.

use crate::node::{ExecutionMode, IterSource, Node};
use crate::plan::{CompiledPlan, Step};
use serde::Serialize;

/// Plan visualization format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizationFormat {
    /// DOT format for Graphviz
    Dot,
    /// Mermaid diagram format
    Mermaid,
}

/// Visualization options
#[derive(Debug, Clone)]
pub struct VisualizationOptions {
    pub format: VisualizationFormat,
    /// Include output keys, execution modes and markers in node labels
    pub include_details: bool,
    pub title: Option<String>,
}

impl Default for VisualizationOptions {
    fn default() -> Self {
        Self {
            format: VisualizationFormat::Mermaid,
            include_details: false,
            title: None,
        }
    }
}

impl VisualizationOptions {
    pub fn dot() -> Self {
        Self {
            format: VisualizationFormat::Dot,
            ..Default::default()
        }
    }

    pub fn mermaid() -> Self {
        Self {
            format: VisualizationFormat::Mermaid,
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_details(mut self) -> Self {
        self.include_details = true;
        self
    }
}

/// Serializable description of one compiled step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub index: usize,
    pub nodes: Vec<String>,
    pub output_key: String,
    pub mode: ExecutionMode,
    pub exploded: bool,
    pub pass_through: bool,
    /// Input key an iterator chain iterates over
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterates_over: Option<String>,
    pub predecessors: Vec<usize>,
}

/// Serializable description of a compiled plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub steps: Vec<StepSummary>,
    pub generations: Vec<Vec<String>>,
}

impl CompiledPlan {
    /// Render the plan as a diagram.
    pub fn visualize(&self, options: &VisualizationOptions) -> String {
        match options.format {
            VisualizationFormat::Dot => visualize_dot(self, options),
            VisualizationFormat::Mermaid => visualize_mermaid(self, options),
        }
    }

    pub fn summary(&self) -> PlanSummary {
        let steps = self
            .steps()
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let publisher = publisher(step);
                StepSummary {
                    index,
                    nodes: step.node_names(),
                    output_key: publisher.output_key().to_string(),
                    mode: publisher.mode(),
                    exploded: publisher.is_exploded(),
                    pass_through: publisher.is_pass_through(),
                    iterates_over: match step {
                        Step::Chain(chain) => Some(chain.over().to_string()),
                        Step::Node(_) => None,
                    },
                    predecessors: self.predecessors(index).iter().copied().collect(),
                }
            })
            .collect();

        PlanSummary {
            steps,
            generations: self.planned_generations(),
        }
    }
}

fn publisher(step: &Step) -> &Node {
    match step {
        Step::Node(node) => node,
        Step::Chain(chain) => chain.terminal(),
    }
}

fn step_label(step: &Step, options: &VisualizationOptions) -> String {
    let label = step.label();
    if !options.include_details {
        return label;
    }

    let node = publisher(step);
    let mode = match node.mode() {
        ExecutionMode::Inline => "inline",
        ExecutionMode::Deferred => "deferred",
    };
    let mut details = vec![format!("key: {}", node.output_key()), format!("mode: {}", mode)];
    if node.is_exploded() {
        details.push("explode".to_string());
    }
    if let Step::Chain(chain) = step {
        details.push(format!("over: {}", chain.over()));
    } else if let Some(IterSource::Key(key)) = node.iterator() {
        details.push(format!("over: {}", key));
    }
    format!("{}\n{}", label, details.join("\n"))
}

fn visualize_dot(plan: &CompiledPlan, options: &VisualizationOptions) -> String {
    let mut output = String::new();

    output.push_str("digraph G {\n");
    output.push_str("    rankdir=TB;\n");
    output.push_str("    node [shape=box, style=rounded];\n");

    if let Some(title) = &options.title {
        output.push_str("    labelloc=\"t\";\n");
        output.push_str(&format!("    label=\"{}\";\n", escape_dot(title)));
    }

    for (index, step) in plan.steps().iter().enumerate() {
        let style = match step {
            Step::Chain(_) => ", style=\"rounded,dashed\"",
            Step::Node(node) if node.is_pass_through() => ", shape=ellipse",
            Step::Node(_) => "",
        };
        output.push_str(&format!(
            "    \"s{}\" [label=\"{}\"{}];\n",
            index,
            escape_dot(&step_label(step, options)),
            style
        ));
    }

    for index in 0..plan.len() {
        for succ in plan.successors(index) {
            output.push_str(&format!("    \"s{}\" -> \"s{}\";\n", index, succ));
        }
    }

    output.push_str("}\n");
    output
}

fn visualize_mermaid(plan: &CompiledPlan, options: &VisualizationOptions) -> String {
    let mut output = String::new();

    output.push_str("graph TD\n");
    if let Some(title) = &options.title {
        output.push_str(&format!("    title[\"{}\"]\n", escape_mermaid(title)));
    }

    for (index, step) in plan.steps().iter().enumerate() {
        let label = escape_mermaid(&step_label(step, options));
        let (open, close, fill) = match step {
            Step::Chain(_) => ("[[", "]]", "#E6F0FF"),
            Step::Node(node) if node.is_pass_through() => ("((", "))", "#FFFFFF"),
            Step::Node(node) if node.is_exploded() => ("[/", "/]", "#FFE4B5"),
            Step::Node(_) => ("[", "]", "#F0F0F0"),
        };
        output.push_str(&format!("    s{}{}\"{}\"{}\n", index, open, label, close));
        output.push_str(&format!(
            "    style s{} fill:{},stroke:#666,stroke-width:2px\n",
            index, fill
        ));
    }

    for index in 0..plan.len() {
        for succ in plan.successors(index) {
            output.push_str(&format!("    s{} --> s{}\n", index, succ));
        }
    }

    output
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_mermaid(s: &str) -> String {
    s.replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\n', "<br/>")
}

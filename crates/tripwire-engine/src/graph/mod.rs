//! Flow graphs: typed trigger/action/outcome DAGs.
//!
//! A flow is a directed graph of `Node`s connected by `Edge`s. Triggers start
//! a run, actions change infrastructure, outcomes conclude or branch. Edges
//! out of a conditional outcome may carry `Guard`s over earlier action
//! results.
//!
//! `validate` turns a `FlowGraph` into a `ValidGraph`; the `FlowExecutor`
//! walks a `ValidGraph` in topological order.

pub mod authoring;
pub mod edge;
pub mod executor;
pub mod flow;
pub mod node;
pub mod validate;

pub use authoring::{AuthoringEdge, AuthoringFlow, AuthoringNode};
pub use edge::{Edge, Guard};
pub use executor::{FlowExecutor, RunStep};
pub use flow::FlowGraph;
pub use node::{ActionNode, Node, NodeKind, OutcomeKind, TriggerSpec};
pub use validate::{validate, ValidGraph};

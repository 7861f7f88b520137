//! Tripwire engine: condition evaluation, flow graphs, the decision gate,
//! run execution with durable checkpoints, approvals and scheduling.
//!
//! [`Engine`] is the entry point. Everything else is usable on its own and
//! is exercised independently in tests.

pub mod approval;
pub mod audit;
pub mod builtin;
pub mod condition;
pub mod engine;
pub mod flows;
pub mod gate;
pub mod graph;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use approval::ApprovalBroker;
pub use audit::AuditLog;
pub use condition::{evaluate, SampleWindow, ThresholdPolicy, TriggerDecision};
pub use engine::{read_flow_file, Engine};
pub use flows::{Admission, FlowRegistry, FlowSummary};
pub use gate::{ConfidenceBasis, DecisionGate, Verdict};
pub use graph::{
    validate, AuthoringFlow, Edge, FlowExecutor, FlowGraph, Guard, Node, NodeKind, OutcomeKind,
    RunStep, TriggerSpec, ValidGraph,
};
pub use registry::ExecutorRegistry;
pub use scheduler::{FireResult, FlowLocks, Scheduler, TriggerIndex};
pub use store::SqliteRunStore;

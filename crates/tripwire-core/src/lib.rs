pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod metric;
pub mod policy;
pub mod traits;
pub mod types;

pub use action::{ActionContext, ActionKind, ActionOutcome, ActionSpec, HttpMethod};
pub use config::AppConfig;
pub use error::{Result, TripwireError, ValidationError};
pub use event::EventBus;
pub use metric::{Metric, MetricSample};
pub use policy::{GateDecision, GatePolicy, PriorityMatcher, PriorityRule, RulePriority, TrafficSelector};
pub use traits::{ActionExecutor, RunStore, StoredFlow};
pub use types::*;

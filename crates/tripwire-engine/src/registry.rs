use std::collections::BTreeMap;
use std::sync::Arc;

use tripwire_core::action::ActionKind;
use tripwire_core::config::AppConfig;
use tripwire_core::traits::ActionExecutor;

use crate::builtin::{ApiCallExecutor, NotificationExecutor, ScriptExecutor, WebhookExecutor};

/// Registry of action executors, one per capability.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for its kind.
    pub fn register(&mut self, executor: impl ActionExecutor) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn ActionExecutor>) {
        let kind = executor.kind();
        if self.executors.insert(kind, executor).is_some() {
            tracing::debug!(action = %kind, "Replaced action executor");
        }
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Registered capabilities, sorted.
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.executors.keys().copied().collect()
    }

    /// Create a registry with the built-in executors the config enables.
    pub fn with_builtins(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        let executors = &config.executors;
        let workspace = config.workspace_dir();

        if executors.script.enabled {
            registry.register(ScriptExecutor::new(&executors.script, &workspace));
        }
        if executors.api_call.enabled {
            registry.register(ApiCallExecutor::new(&executors.api_call));
        }
        if executors.notification.enabled {
            registry.register(NotificationExecutor::new(&executors.notification, &workspace));
        }
        for hook in &executors.webhooks {
            for kind in &hook.kinds {
                registry.register(WebhookExecutor::new(*kind, hook));
            }
        }
        registry
    }
}

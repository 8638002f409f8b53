use autoplan_core::ExecutionConfig;
use autoplan_tools::ToolRegistry;
use serde_json::Value;

/// Everything a session needs from its caller: the tools, the execution
/// settings and the application arguments handed to planner and combiner.
///
/// Built once per session and shared read-only.
#[derive(Clone)]
pub struct ExecutionContext {
    registry: ToolRegistry,
    config: ExecutionConfig,
    args: Value,
}

impl ExecutionContext {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            config: ExecutionConfig::default(),
            args: Value::Null,
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn args(&self) -> &Value {
        &self.args
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tools", &self.registry.names())
            .field("config", &self.config)
            .field("args", &self.args)
            .finish()
    }
}

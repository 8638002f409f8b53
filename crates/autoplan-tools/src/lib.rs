mod executor;
mod fn_tool;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use autoplan_core::{AutoplanError, Tool, ToolDefinition, ValidationError};
use serde_json::Value;

pub use executor::ToolExecutor;
pub use fn_tool::{FnTool, FnToolBuilder};

/// Name-keyed set of tools available to plans.
///
/// Cloning is cheap and clones share the same underlying map.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails with `DuplicateTool` if the name is taken.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), AutoplanError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| AutoplanError::Config(format!("registry lock poisoned: {e}")))?;
        let name = tool.name().to_string();
        if guard.contains_key(&name) {
            return Err(AutoplanError::DuplicateTool(name));
        }
        tracing::debug!(tool = %name, "tool registered");
        guard.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let guard = self.inner.read().ok()?;
        guard.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.inner.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Planner-facing definitions of every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = match self.inner.read() {
            Ok(guard) => guard.values().map(|t| t.as_tool_definition()).collect(),
            Err(_) => Vec::new(),
        };
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a tool by name and invoke it with schema-checked arguments.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, AutoplanError> {
        let tool = self.get(name).ok_or_else(|| ValidationError::UnknownTool {
            step: None,
            tool: name.to_string(),
        })?;
        invoke_tool(tool.as_ref(), args).await
    }
}

/// Validate `args` against the tool's schema, then call it exactly once.
///
/// Schema violations surface as `Validation` errors without calling the tool;
/// handler failures are wrapped in `ToolExecution`.
pub async fn invoke_tool(tool: &dyn Tool, args: Value) -> Result<Value, AutoplanError> {
    tool.parameters().validate(tool.name(), &args)?;
    tool.call(args)
        .await
        .map_err(|source| AutoplanError::ToolExecution {
            tool: tool.name().to_string(),
            source: Box::new(source),
        })
}

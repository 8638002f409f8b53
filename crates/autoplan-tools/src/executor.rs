use std::time::Duration;

use autoplan_core::{AutoplanError, ValidationError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{invoke_tool, ToolRegistry};

/// Invokes registered tools with an optional per-call timeout and
/// cooperative cancellation.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one call. A cancelled token or an expired timeout drops the
    /// in-flight tool future.
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, AutoplanError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ValidationError::UnknownTool {
                step: None,
                tool: tool_name.to_string(),
            })?;

        let call = invoke_tool(tool.as_ref(), args);
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                    AutoplanError::Timeout(format!(
                        "tool '{tool_name}' exceeded {}ms",
                        limit.as_millis()
                    ))
                })?,
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(tool = %tool_name, "tool call cancelled");
                Err(AutoplanError::Cancelled(format!("tool '{tool_name}' cancelled")))
            }
            result = bounded => result,
        }
    }

    /// Execute all calls concurrently; results come back in input order.
    pub async fn execute_all(
        &self,
        calls: Vec<(String, Value)>,
    ) -> Vec<Result<Value, AutoplanError>> {
        let futures: Vec<_> = calls
            .into_iter()
            .map(|(name, args)| async move { self.execute(&name, args).await })
            .collect();
        futures::future::join_all(futures).await
    }
}

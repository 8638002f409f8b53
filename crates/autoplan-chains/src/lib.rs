use std::sync::Arc;

use async_trait::async_trait;
use autoplan_core::{AutoplanError, ParamType, ParameterSchema, Tool};
use heck::ToUpperCamelCase;
use serde_json::{Map, Value};

/// Name of the parameter that receives the previous stage's output, when a
/// stage declares it.
pub const RESULT_PARAMETER: &str = "result";

/// Convert a tool name such as `times_six` to `TimesSix`.
pub fn pascal_case(name: &str) -> String {
    name.to_upper_camel_case()
}

struct Stage {
    tool: Arc<dyn Tool>,
    /// Parameter bound to the previous stage's output. `None` for the first stage.
    slot: Option<String>,
}

/// A tool that runs its component tools in order, feeding each stage's
/// output into the next stage's result slot.
///
/// The parameter schema is merged once at construction. Parameters shared by
/// several stages are supplied once by the caller and forwarded to every
/// stage that declares them.
pub struct ChainedTool {
    name: String,
    description: String,
    parameters: ParameterSchema,
    output_type: ParamType,
    accepts_prior_results: bool,
    stages: Vec<Stage>,
}

/// Chain `tools` under a name synthesized from the component names.
pub fn chain(tools: Vec<Arc<dyn Tool>>) -> Result<ChainedTool, AutoplanError> {
    let name: String = tools.iter().map(|t| pascal_case(t.name())).collect();
    ChainedTool::build(name, tools)
}

/// Chain `tools` under `PascalCase(name)`.
pub fn chain_with_name(
    name: impl AsRef<str>,
    tools: Vec<Arc<dyn Tool>>,
) -> Result<ChainedTool, AutoplanError> {
    ChainedTool::build(pascal_case(name.as_ref()), tools)
}

fn result_slot(tool: &dyn Tool) -> Result<String, AutoplanError> {
    let params = tool.parameters();
    if params.contains(RESULT_PARAMETER) {
        return Ok(RESULT_PARAMETER.to_string());
    }
    let mut required = params.required();
    match (required.next(), required.next()) {
        (Some(only), None) => Ok(only.name.clone()),
        _ => Err(AutoplanError::Config(format!(
            "tool '{}' cannot be chained: it needs a '{RESULT_PARAMETER}' parameter or exactly one required parameter",
            tool.name()
        ))),
    }
}

impl ChainedTool {
    fn build(name: String, tools: Vec<Arc<dyn Tool>>) -> Result<Self, AutoplanError> {
        let Some(first) = tools.first() else {
            return Err(AutoplanError::Config(
                "cannot chain an empty list of tools".to_string(),
            ));
        };
        let mut parameters = first.parameters().clone();
        let mut stages = Vec::with_capacity(tools.len());

        for (position, tool) in tools.iter().enumerate() {
            let slot = if position == 0 {
                None
            } else {
                Some(result_slot(tool.as_ref())?)
            };

            for param in tool.parameters().iter() {
                if slot.as_deref() == Some(param.name.as_str()) {
                    continue;
                }
                match parameters.get_mut(&param.name) {
                    Some(existing) => {
                        if existing.param_type != param.param_type {
                            return Err(AutoplanError::Config(format!(
                                "parameter '{}' is {} in one chained tool and {} in '{}'",
                                param.name,
                                existing.param_type,
                                param.param_type,
                                tool.name()
                            )));
                        }
                        existing.required |= param.required;
                    }
                    None => {
                        parameters.insert(param.clone());
                    }
                }
            }

            stages.push(Stage {
                tool: Arc::clone(tool),
                slot,
            });
        }

        let description = format!(
            "Runs {} in sequence, passing each output to the next tool.",
            tools
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        let output_type = stages
            .last()
            .map(|s| s.tool.output_type())
            .unwrap_or(ParamType::Any);
        let accepts_prior_results = stages.iter().any(|s| s.tool.accepts_prior_results());

        Ok(Self {
            name,
            description,
            parameters,
            output_type,
            accepts_prior_results,
            stages,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Names of the component tools, in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.tool.name()).collect()
    }
}

fn stage_args(stage: &Stage, supplied: &Map<String, Value>, previous: Option<Value>) -> Value {
    let mut args = Map::new();
    for param in stage.tool.parameters().iter() {
        if stage.slot.as_deref() == Some(param.name.as_str()) {
            continue;
        }
        if let Some(value) = supplied.get(&param.name) {
            args.insert(param.name.clone(), value.clone());
        }
    }
    if let (Some(slot), Some(value)) = (&stage.slot, previous) {
        args.insert(slot.clone(), value);
    }
    Value::Object(args)
}

#[async_trait]
impl Tool for ChainedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ParameterSchema {
        &self.parameters
    }

    fn output_type(&self) -> ParamType {
        self.output_type
    }

    fn accepts_prior_results(&self) -> bool {
        self.accepts_prior_results
    }

    async fn call(&self, args: Value) -> Result<Value, AutoplanError> {
        let empty = Map::new();
        let supplied = args.as_object().unwrap_or(&empty);
        let mut previous = None;

        for (position, stage) in self.stages.iter().enumerate() {
            let tool = stage.tool.as_ref();
            let stage_err = |source: AutoplanError| AutoplanError::ChainStage {
                stage: position,
                tool: tool.name().to_string(),
                source: Box::new(source),
            };

            let stage_input = stage_args(stage, supplied, previous.take());
            tracing::debug!(chain = %self.name, stage = position, tool = %tool.name(), "chain stage started");
            tool.parameters()
                .validate(tool.name(), &stage_input)
                .map_err(|e| stage_err(e.into()))?;
            let output = tool.call(stage_input).await.map_err(stage_err)?;
            previous = Some(output);
        }

        previous.ok_or_else(|| AutoplanError::Config(format!("chain '{}' has no stages", self.name)))
    }
}

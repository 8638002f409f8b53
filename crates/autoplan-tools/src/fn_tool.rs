use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use autoplan_core::{AutoplanError, ParamType, Parameter, ParameterSchema, Tool};
use serde_json::Value;

type ToolFn =
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, AutoplanError>> + Send>>
        + Send
        + Sync;

/// A tool backed by an async closure, with an explicitly declared schema.
///
/// ```ignore
/// let double = FnTool::builder("double")
///     .description("Multiply by two")
///     .param("x", ParamType::Integer)
///     .output(ParamType::Integer)
///     .build(|args| async move {
///         Ok(json!(args["x"].as_i64().unwrap_or(0) * 2))
///     });
/// ```
pub struct FnTool {
    name: String,
    description: String,
    parameters: ParameterSchema,
    output_type: ParamType,
    accepts_prior_results: bool,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn builder(name: impl Into<String>) -> FnToolBuilder {
        FnToolBuilder {
            name: name.into(),
            description: String::new(),
            parameters: ParameterSchema::new(),
            output_type: ParamType::Any,
            accepts_prior_results: false,
        }
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("output_type", &self.output_type)
            .finish_non_exhaustive()
    }
}

pub struct FnToolBuilder {
    name: String,
    description: String,
    parameters: ParameterSchema,
    output_type: ParamType,
    accepts_prior_results: bool,
}

impl FnToolBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(self, name: impl Into<String>, param_type: ParamType) -> Self {
        self.parameter(Parameter::required(name, param_type))
    }

    pub fn optional_param(self, name: impl Into<String>, param_type: ParamType) -> Self {
        self.parameter(Parameter::optional(name, param_type))
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters = self.parameters.with(parameter);
        self
    }

    pub fn output(mut self, output_type: ParamType) -> Self {
        self.output_type = output_type;
        self
    }

    /// Allow plan steps to bind this tool's parameters to prior step results.
    pub fn accepts_prior_results(mut self) -> Self {
        self.accepts_prior_results = true;
        self
    }

    pub fn build<F, Fut>(self, func: F) -> FnTool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AutoplanError>> + Send + 'static,
    {
        FnTool {
            name: self.name,
            description: self.description,
            parameters: self.parameters,
            output_type: self.output_type,
            accepts_prior_results: self.accepts_prior_results,
            func: Box::new(move |args| Box::pin(func(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
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
        (self.func)(args).await
    }
}

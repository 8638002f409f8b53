use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

/// The JSON type a tool parameter (or a tool output) is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }

    /// Whether `value` is an instance of this type. Integers are also numbers.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the JSON type of `value`, used in error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A single declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Ordered, statically declared parameter list of a tool.
///
/// Built once when the tool is constructed; parameter names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema {
    params: Vec<Parameter>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert). A parameter whose name is
    /// already declared replaces the earlier declaration.
    pub fn with(mut self, parameter: Parameter) -> Self {
        match self.params.iter_mut().find(|p| p.name == parameter.name) {
            Some(existing) => *existing = parameter,
            None => self.params.push(parameter),
        }
        self
    }

    /// Append a parameter. Returns `false` (and leaves the schema unchanged)
    /// if a parameter of the same name already exists.
    pub fn insert(&mut self, parameter: Parameter) -> bool {
        if self.contains(&parameter.name) {
            return false;
        }
        self.params.push(parameter);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn required(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(|p| p.required)
    }

    /// Render as a JSON-schema object (`type`, `properties`, `required`).
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut prop = Map::new();
            if param.param_type != ParamType::Any {
                prop.insert("type".to_string(), json!(param.param_type.as_str()));
            }
            if let Some(description) = &param.description {
                prop.insert("description".to_string(), json!(description));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
        }
        let required: Vec<&str> = self.required().map(|p| p.name.as_str()).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check a single argument value against its declaration.
    ///
    /// `null` is accepted for optional parameters.
    pub fn check_value(
        &self,
        tool: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), ValidationError> {
        let param = self
            .get(name)
            .ok_or_else(|| ValidationError::UnknownParameter {
                step: None,
                tool: tool.to_string(),
                parameter: name.to_string(),
            })?;
        if value.is_null() && !param.required {
            return Ok(());
        }
        if !param.param_type.matches(value) {
            return Err(ValidationError::ArgumentType {
                step: None,
                tool: tool.to_string(),
                parameter: name.to_string(),
                expected: param.param_type,
                found: json_type_name(value).to_string(),
            });
        }
        Ok(())
    }

    /// Validate a full argument object: it must be a JSON object, every
    /// required parameter must be present, and every present argument must
    /// be declared and well-typed.
    pub fn validate(&self, tool: &str, args: &Value) -> Result<(), ValidationError> {
        let object = args.as_object().ok_or_else(|| ValidationError::ArgumentType {
            step: None,
            tool: tool.to_string(),
            parameter: "<arguments>".to_string(),
            expected: ParamType::Object,
            found: json_type_name(args).to_string(),
        })?;

        for param in self.required() {
            if !object.contains_key(&param.name) {
                return Err(ValidationError::MissingParameter {
                    step: None,
                    tool: tool.to_string(),
                    parameter: param.name.clone(),
                });
            }
        }

        for (name, value) in object {
            self.check_value(tool, name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<Parameter> for ParameterSchema {
    fn from_iter<T: IntoIterator<Item = Parameter>>(iter: T) -> Self {
        iter.into_iter().fold(Self::new(), |schema, p| schema.with(p))
    }
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

/// Planner-facing description of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub output_type: ParamType,
    pub accepts_prior_results: bool,
}

/// A named, schema-typed callable unit of work.
///
/// Implementations are immutable once registered. `call` receives arguments
/// that have already been validated against [`parameters`](Tool::parameters)
/// when invoked through the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> &ParameterSchema;

    fn output_type(&self) -> ParamType {
        ParamType::Any
    }

    /// Whether plan steps may bind this tool's parameters to prior step results.
    fn accepts_prior_results(&self) -> bool {
        false
    }

    async fn call(&self, args: Value) -> Result<Value, AutoplanError>;

    fn as_tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters().to_json_schema(),
            output_type: self.output_type(),
            accepts_prior_results: self.accepts_prior_results(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan / Step model
// ---------------------------------------------------------------------------

/// "Use the output produced by the step at this position."
///
/// The index is kept signed so that malformed planner output (negative
/// indices) survives parsing and is rejected by validation instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorResultRef {
    index: i64,
}

impl PriorResultRef {
    pub fn new(index: i64) -> Self {
        Self { index }
    }

    pub fn index(&self) -> i64 {
        self.index
    }
}

/// A step argument: either a literal value or a reference to a prior result.
///
/// Serialized as `{"literal": <value>}` or `{"priorResultIndex": <int>}` so the
/// two shapes can never be confused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgumentBinding {
    #[serde(rename = "literal")]
    Literal(Value),
    #[serde(rename = "priorResultIndex")]
    PriorResult(PriorResultRef),
}

impl ArgumentBinding {
    pub fn literal(value: impl Into<Value>) -> Self {
        ArgumentBinding::Literal(value.into())
    }

    pub fn prior_result(index: i64) -> Self {
        ArgumentBinding::PriorResult(PriorResultRef::new(index))
    }

    pub fn as_prior_result(&self) -> Option<PriorResultRef> {
        match self {
            ArgumentBinding::PriorResult(r) => Some(*r),
            ArgumentBinding::Literal(_) => None,
        }
    }
}

/// One tool invocation within a plan, addressed by its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_deserializing)]
    index: usize,
    #[serde(rename = "tool")]
    pub tool_name: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub bindings: BTreeMap<String, ArgumentBinding>,
}

impl Step {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            index: 0,
            tool_name: tool_name.into(),
            rationale: String::new(),
            objective: String::new(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = objective.into();
        self
    }

    pub fn with_binding(mut self, parameter: impl Into<String>, binding: ArgumentBinding) -> Self {
        self.bindings.insert(parameter.into(), binding);
        self
    }

    /// Bind a parameter to a literal value.
    pub fn bind(self, parameter: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_binding(parameter, ArgumentBinding::literal(value))
    }

    /// Bind a parameter to the output of the step at `index`.
    pub fn bind_prior_result(self, parameter: impl Into<String>, index: i64) -> Self {
        self.with_binding(parameter, ArgumentBinding::prior_result(index))
    }

    /// Position of this step in its plan. Assigned by [`Plan::new`].
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn prior_result_refs(&self) -> impl Iterator<Item = (&str, PriorResultRef)> {
        self.bindings
            .iter()
            .filter_map(|(name, binding)| binding.as_prior_result().map(|r| (name.as_str(), r)))
    }
}

#[derive(Deserialize)]
struct PlanDocument {
    #[serde(default)]
    rationale: String,
    steps: Vec<Step>,
}

impl From<PlanDocument> for Plan {
    fn from(doc: PlanDocument) -> Self {
        Plan::new(doc.rationale, doc.steps)
    }
}

/// An ordered sequence of steps produced by a planner.
///
/// Step order defines indices and is never reshuffled after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PlanDocument")]
pub struct Plan {
    pub rationale: String,
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(rationale: impl Into<String>, mut steps: Vec<Step>) -> Self {
        for (index, step) in steps.iter_mut().enumerate() {
            step.index = index;
        }
        Self {
            rationale: rationale.into(),
            steps,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Outcome of one step. `value` is present iff Succeeded, `error` iff Failed,
/// `skipped_because` (the dependency that did not succeed) iff Skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub tool: String,
    pub status: StepStatus,
    /// A succeeded step that returned `null` keeps `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<usize>,
}

// A present `value` key is always Some, even when it holds `null`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl StepResult {
    pub fn pending(step_index: usize, tool: impl Into<String>) -> Self {
        Self {
            step_index,
            tool: tool.into(),
            status: StepStatus::Pending,
            value: None,
            error: None,
            skipped_because: None,
        }
    }

    pub fn succeeded(step_index: usize, tool: impl Into<String>, value: Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            value: Some(value),
            ..Self::pending(step_index, tool)
        }
    }

    pub fn failed(step_index: usize, tool: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.to_string()),
            ..Self::pending(step_index, tool)
        }
    }

    pub fn skipped(step_index: usize, tool: impl Into<String>, dependency: usize) -> Self {
        Self {
            status: StepStatus::Skipped,
            skipped_because: Some(dependency),
            ..Self::pending(step_index, tool)
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress events of a planning session, in the order observers see them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlanEvent {
    /// A partially parsed plan streamed by the planner.
    PartialPlanResult { session_id: String, plan: Value },
    /// The full plan, emitted once it has passed validation.
    PlanResult { session_id: String, plan: Plan },
    /// A step reached a terminal state.
    StepResult {
        session_id: String,
        result: StepResult,
    },
    /// The combined output; always the last event of a successful session.
    FinalResult { session_id: String, output: Value },
}

impl PlanEvent {
    pub fn session_id(&self) -> &str {
        match self {
            PlanEvent::PartialPlanResult { session_id, .. } => session_id,
            PlanEvent::PlanResult { session_id, .. } => session_id,
            PlanEvent::StepResult { session_id, .. } => session_id,
            PlanEvent::FinalResult { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PlanEvent::PartialPlanResult { .. } => "partial_plan_result",
            PlanEvent::PlanResult { .. } => "plan_result",
            PlanEvent::StepResult { .. } => "step_result",
            PlanEvent::FinalResult { .. } => "final_result",
        }
    }
}

/// Receives every event of a session as it is emitted.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn on_event(&self, event: PlanEvent) -> Result<(), AutoplanError>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn step_suffix(step: &Option<usize>) -> String {
    match step {
        Some(step) => format!(" (step {step})"),
        None => String::new(),
    }
}

/// A malformed plan or a malformed argument set. Always raised before the
/// affected tool runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("step {step} references its own result through parameter '{parameter}'")]
    SelfReference { step: usize, parameter: String },
    #[error("step {step} references later step {index} through parameter '{parameter}'")]
    ForwardReference {
        step: usize,
        parameter: String,
        index: i64,
    },
    #[error("step {step} references step {index} through parameter '{parameter}', outside 0..{len}")]
    OutOfRange {
        step: usize,
        parameter: String,
        index: i64,
        len: usize,
    },
    #[error("tool not found: {tool}{}", step_suffix(.step))]
    UnknownTool { step: Option<usize>, tool: String },
    #[error("missing required parameter '{parameter}' for tool '{tool}'{}", step_suffix(.step))]
    MissingParameter {
        step: Option<usize>,
        tool: String,
        parameter: String,
    },
    #[error("parameter '{parameter}' of tool '{tool}' expects {expected}, found {found}{}", step_suffix(.step))]
    ArgumentType {
        step: Option<usize>,
        tool: String,
        parameter: String,
        expected: ParamType,
        found: String,
    },
    #[error("tool '{tool}' has no parameter '{parameter}'{}", step_suffix(.step))]
    UnknownParameter {
        step: Option<usize>,
        tool: String,
        parameter: String,
    },
}

impl ValidationError {
    /// Attach the step index to a schema-level error.
    pub fn in_step(self, index: usize) -> Self {
        match self {
            ValidationError::UnknownTool { tool, .. } => ValidationError::UnknownTool {
                step: Some(index),
                tool,
            },
            ValidationError::MissingParameter {
                tool, parameter, ..
            } => ValidationError::MissingParameter {
                step: Some(index),
                tool,
                parameter,
            },
            ValidationError::ArgumentType {
                tool,
                parameter,
                expected,
                found,
                ..
            } => ValidationError::ArgumentType {
                step: Some(index),
                tool,
                parameter,
                expected,
                found,
            },
            ValidationError::UnknownParameter {
                tool, parameter, ..
            } => ValidationError::UnknownParameter {
                step: Some(index),
                tool,
                parameter,
            },
            other => other,
        }
    }
}

/// Unified error type for Autoplan.
#[derive(Debug, Error)]
pub enum AutoplanError {
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("tool '{tool}' failed: {source}")]
    ToolExecution {
        tool: String,
        source: Box<AutoplanError>,
    },
    #[error("chain stage {stage} ('{tool}') failed: {source}")]
    ChainStage {
        stage: usize,
        tool: String,
        source: Box<AutoplanError>,
    },
    #[error("tool error: {0}")]
    Tool(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("planner error: {0}")]
    Planner(String),
    #[error("parsing error: {0}")]
    Parsing(String),
    #[error("combination unavailable: {reason}")]
    CombinationUnavailable { steps: Vec<usize>, reason: String },
    #[error("combiner error: {0}")]
    Combiner(String),
    #[error("scheduling error: {0}")]
    Scheduling(String),
    #[error("callback error: {0}")]
    Callback(String),
    /// A session's terminal failure, reported from its final report.
    #[error("session failed: {0}")]
    Session(String),
    #[error("config error: {0}")]
    Config(String),
}

impl AutoplanError {
    /// True for errors that reject a plan before any step runs.
    pub fn is_plan_validation(&self) -> bool {
        matches!(self, AutoplanError::Validation(_))
    }

    /// The error raised by the innermost tool, unwrapping execution and
    /// chain-stage tags.
    pub fn innermost(&self) -> &AutoplanError {
        match self {
            AutoplanError::ToolExecution { source, .. } => source.innermost(),
            AutoplanError::ChainStage { source, .. } => source.innermost(),
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

/// Concurrency used when [`ExecutionConfig::max_concurrency`] is unset.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Per-session execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Timeout applied to every individual tool invocation.
    #[serde(default)]
    pub tool_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionConfig {
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concurrency limit actually enforced; never below one.
    pub fn effective_max_concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
            .max(1)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_ms.map(Duration::from_millis)
    }
}

use autoplan_core::{ArgumentBinding, Plan, Step, ValidationError};
use autoplan_tools::ToolRegistry;

/// Reject malformed plans before anything runs.
///
/// Every prior-result reference must point strictly backward into the plan,
/// so the dependency graph of a plan that passes is acyclic. Reference errors
/// are reported before tool and argument errors.
pub fn validate_plan(plan: &Plan, registry: &ToolRegistry) -> Result<(), ValidationError> {
    for step in plan.steps() {
        check_references(step, plan.len())?;
    }
    for step in plan.steps() {
        check_tool(step, registry)?;
    }
    Ok(())
}

fn check_references(step: &Step, len: usize) -> Result<(), ValidationError> {
    let own = step.index() as i64;
    for (parameter, reference) in step.prior_result_refs() {
        let index = reference.index();
        if index < 0 || index >= len as i64 {
            return Err(ValidationError::OutOfRange {
                step: step.index(),
                parameter: parameter.to_string(),
                index,
                len,
            });
        }
        if index == own {
            return Err(ValidationError::SelfReference {
                step: step.index(),
                parameter: parameter.to_string(),
            });
        }
        if index > own {
            return Err(ValidationError::ForwardReference {
                step: step.index(),
                parameter: parameter.to_string(),
                index,
            });
        }
    }
    Ok(())
}

fn check_tool(step: &Step, registry: &ToolRegistry) -> Result<(), ValidationError> {
    let at = step.index();
    let tool = registry
        .get(&step.tool_name)
        .ok_or_else(|| ValidationError::UnknownTool {
            step: Some(at),
            tool: step.tool_name.clone(),
        })?;
    let schema = tool.parameters();

    for (name, binding) in &step.bindings {
        let param = schema
            .get(name)
            .ok_or_else(|| ValidationError::UnknownParameter {
                step: Some(at),
                tool: step.tool_name.clone(),
                parameter: name.clone(),
            })?;
        match binding {
            ArgumentBinding::Literal(value) => schema
                .check_value(tool.name(), name, value)
                .map_err(|e| e.in_step(at))?,
            // The referenced output's type is only known once that step has
            // run; it is checked when the arguments are resolved.
            ArgumentBinding::PriorResult(_) if !tool.accepts_prior_results() => {
                return Err(ValidationError::ArgumentType {
                    step: Some(at),
                    tool: step.tool_name.clone(),
                    parameter: name.clone(),
                    expected: param.param_type,
                    found: "prior result reference".to_string(),
                });
            }
            ArgumentBinding::PriorResult(_) => {}
        }
    }

    if let Some(missing) = schema.required().find(|p| !step.bindings.contains_key(&p.name)) {
        return Err(ValidationError::MissingParameter {
            step: Some(at),
            tool: step.tool_name.clone(),
            parameter: missing.name.clone(),
        });
    }
    Ok(())
}

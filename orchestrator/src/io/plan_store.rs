//! Plan file loading with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::plan::execution_order;
use crate::core::types::DecompositionPlan;

/// Bundled JSON Schema for plan files.
pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

/// Load and validate a plan from disk (schema + invariants).
pub fn load_plan(path: &Path) -> Result<DecompositionPlan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&contents).with_context(|| format!("load plan {}", path.display()))
}

/// Parse a plan document and check it is executable.
pub fn parse_plan(contents: &str) -> Result<DecompositionPlan> {
    let value: Value = serde_json::from_str(contents).context("parse plan json")?;
    validate_schema(&value)?;
    let plan: DecompositionPlan = serde_json::from_value(value).context("deserialize plan")?;
    // Surfaces invariant violations and cycles as a typed error.
    execution_order(&plan)?;
    Ok(plan)
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/*!
# Parameter Resolver

Validates and coerces a raw parameter mapping against a tool's declared
schema: type coercion, required-field presence, default substitution,
range/pattern checks, and asset-derived enrichment. Every violation is
collected so callers can correct all issues in one round trip.
*/

use crate::engines::Engine;
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{ParameterSpec, ParameterType, TargetAsset, ToolDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

pub struct ParameterResolver;

impl ParameterResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `raw` against the tool's schema. Enrichment from `asset`
    /// fills omitted parameters but never overrides an explicit value.
    pub fn resolve(
        &self,
        definition: &ToolDefinition,
        raw: &HashMap<String, Value>,
        asset: Option<&TargetAsset>,
    ) -> RelayResult<HashMap<String, Value>> {
        let mut resolved = HashMap::new();
        let mut violations = Vec::new();

        for spec in &definition.parameters {
            let supplied = raw.get(&spec.name);
            let value = match supplied {
                Some(value) => Some(value.clone()),
                None => Self::enrich(spec, asset).or_else(|| spec.default_value.clone()),
            };

            let value = match value {
                Some(value) => value,
                None => {
                    if spec.required {
                        violations.push(FieldViolation {
                            field: spec.name.clone(),
                            reason: "required parameter missing".to_string(),
                        });
                    }
                    continue;
                }
            };

            match Self::coerce(spec, value) {
                Ok(coerced) => {
                    Self::check_constraints(spec, &coerced, &mut violations);
                    resolved.insert(spec.name.clone(), coerced);
                }
                Err(reason) => violations.push(FieldViolation {
                    field: spec.name.clone(),
                    reason,
                }),
            }
        }

        for name in raw.keys() {
            if definition.parameter(name).is_none() {
                violations.push(FieldViolation {
                    field: name.clone(),
                    reason: "not declared in tool schema".to_string(),
                });
            }
        }

        if violations.is_empty() {
            Ok(resolved)
        } else {
            violations.sort_by(|a, b| a.field.cmp(&b.field));
            Err(RelayError::new(
                ErrorCode::ParameterValidation,
                ErrorCategory::Validation,
                ErrorSeverity::Medium,
                &format!(
                    "parameter validation failed for tool '{}'",
                    definition.name
                ),
            )
            .with_details(violations.iter().map(|v| v.to_string()).collect()))
        }
    }

    /// Asset-derived value for an omitted parameter. Well-known names
    /// map to recorded asset fields; anything else consults the asset's
    /// metadata map.
    fn enrich(spec: &ParameterSpec, asset: Option<&TargetAsset>) -> Option<Value> {
        let asset = asset?;
        match spec.name.as_str() {
            "hostname" => Some(Value::String(asset.hostname.clone())),
            "address" | "host" => Some(Value::String(asset.address.clone())),
            other => asset
                .metadata
                .get(other)
                .map(|v| Value::String(v.clone())),
        }
    }

    fn coerce(spec: &ParameterSpec, value: Value) -> Result<Value, String> {
        match spec.param_type {
            ParameterType::String => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err("expected a string".to_string()),
            },
            ParameterType::Int => match &value {
                Value::Number(n) => {
                    if n.is_i64() || n.is_u64() {
                        Ok(value)
                    } else {
                        Err("expected an integer, got a float".to_string())
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|i| Value::Number(i.into()))
                    .map_err(|_| format!("'{}' is not an integer", s)),
                _ => Err("expected an integer".to_string()),
            },
            ParameterType::Float => match &value {
                Value::Number(_) => Ok(value),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{}' is not a number", s)),
                _ => Err("expected a number".to_string()),
            },
            ParameterType::Bool => match &value {
                Value::Bool(_) => Ok(value),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(format!("'{}' is not a boolean", s)),
                },
                _ => Err("expected a boolean".to_string()),
            },
            ParameterType::List => match &value {
                Value::Array(_) => Ok(value),
                Value::String(s) => Ok(Value::Array(
                    s.split(',')
                        .map(|item| Value::String(item.trim().to_string()))
                        .collect(),
                )),
                _ => Err("expected a list".to_string()),
            },
        }
    }

    fn check_constraints(spec: &ParameterSpec, value: &Value, violations: &mut Vec<FieldViolation>) {
        if let Some(number) = value.as_f64() {
            if let Some(min) = spec.min {
                if number < min {
                    violations.push(FieldViolation {
                        field: spec.name.clone(),
                        reason: format!("{} is below the minimum of {}", number, min),
                    });
                }
            }
            if let Some(max) = spec.max {
                if number > max {
                    violations.push(FieldViolation {
                        field: spec.name.clone(),
                        reason: format!("{} is above the maximum of {}", number, max),
                    });
                }
            }
        }

        if let (Some(pattern), Some(text)) = (&spec.pattern, value.as_str()) {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(text) {
                        violations.push(FieldViolation {
                            field: spec.name.clone(),
                            reason: format!("'{}' does not match pattern '{}'", text, pattern),
                        });
                    }
                }
                Err(_) => violations.push(FieldViolation {
                    field: spec.name.clone(),
                    reason: format!("schema pattern '{}' is not a valid regex", pattern),
                }),
            }
        }
    }
}

impl Default for ParameterResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for ParameterResolver {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn health_check(&self) -> bool {
        true
    }

    fn initialize(&self) -> bool {
        true
    }

    fn shutdown(&self) -> bool {
        true
    }
}

//! Boolean expressions over property fields, used to gate automation on
//! playbooks and runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RunbookError;

/// Deepest level at which `and`/`or` may appear below the root.
pub const MAX_CONDITION_DEPTH: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    pub field_id: String,
    #[serde(default)]
    pub value: Value,
}

/// Externally tagged, so a JSON node carrying two operators fails to parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ConditionExpr {
    And(Vec<ConditionExpr>),
    Or(Vec<ConditionExpr>),
    Is(Comparison),
    IsNot(Comparison),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PropertyFieldType {
    Text,
    Select,
    Multiselect,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PropertyField {
    pub id: String,
    pub field_type: PropertyFieldType,
    #[serde(default)]
    pub option_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyValue {
    pub field_id: String,
    #[serde(default)]
    pub value: Value,
}

/// A stored condition. `run_id` is empty for playbook-level conditions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(default)]
    pub id: String,
    pub playbook_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub version: i64,
    pub expr: ConditionExpr,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
    #[serde(default)]
    pub delete_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct ConditionFilterOptions {
    pub run_id: String,
    pub page: i64,
    pub per_page: i64,
}

impl ConditionExpr {
    /// # Errors
    /// Returns [`RunbookError::InvalidArgument`] when `raw` is not a single
    /// well-formed expression.
    pub fn from_json(raw: &str) -> Result<Self, RunbookError> {
        serde_json::from_str(raw)
            .map_err(|err| RunbookError::InvalidArgument(format!("condition: {err}")))
    }

    /// Checks structure, and value shapes for fields present in `fields`.
    ///
    /// # Errors
    /// Returns [`RunbookError::InvalidArgument`] describing the first problem.
    pub fn validate(&self, fields: &[PropertyField]) -> Result<(), RunbookError> {
        self.validate_at(0, fields)
    }

    fn validate_at(&self, depth: usize, fields: &[PropertyField]) -> Result<(), RunbookError> {
        match self {
            Self::And(children) | Self::Or(children) => {
                if children.is_empty() {
                    return Err(invalid("and/or condition must have at least one nested condition"));
                }
                if depth >= MAX_CONDITION_DEPTH {
                    return Err(invalid(&format!(
                        "condition nesting depth exceeds maximum allowed ({MAX_CONDITION_DEPTH})"
                    )));
                }
                children
                    .iter()
                    .try_for_each(|child| child.validate_at(depth + 1, fields))
            }
            Self::Is(comparison) | Self::IsNot(comparison) => comparison.validate(fields),
        }
    }

    /// Trims whitespace from string comparison values.
    pub fn sanitize(&mut self) {
        match self {
            Self::And(children) | Self::Or(children) => {
                children.iter_mut().for_each(Self::sanitize);
            }
            Self::Is(comparison) | Self::IsNot(comparison) => {
                if let Value::String(text) = &comparison.value {
                    comparison.value = Value::String(text.trim().to_string());
                }
            }
        }
    }

    #[must_use]
    pub fn field_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.visit(&mut |comparison| {
            ids.insert(comparison.field_id.clone());
        });
        ids
    }

    /// Option IDs referenced by select and multiselect comparisons.
    #[must_use]
    pub fn option_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.visit(&mut |comparison| {
            if let Some(options) = string_array(&comparison.value) {
                ids.extend(options);
            }
        });
        ids
    }

    #[must_use]
    pub fn evaluate(&self, fields: &[PropertyField], values: &[PropertyValue]) -> bool {
        let fields: BTreeMap<&str, &PropertyField> =
            fields.iter().map(|field| (field.id.as_str(), field)).collect();
        let values: BTreeMap<&str, &Value> = values
            .iter()
            .map(|value| (value.field_id.as_str(), &value.value))
            .collect();
        self.evaluate_with(&fields, &values)
    }

    fn evaluate_with(
        &self,
        fields: &BTreeMap<&str, &PropertyField>,
        values: &BTreeMap<&str, &Value>,
    ) -> bool {
        match self {
            Self::And(children) => children.iter().all(|child| child.evaluate_with(fields, values)),
            Self::Or(children) => children.iter().any(|child| child.evaluate_with(fields, values)),
            Self::Is(comparison) => {
                match (fields.get(comparison.field_id.as_str()), values.get(comparison.field_id.as_str())) {
                    (Some(field), Some(value)) => comparison.holds_for(field, value),
                    _ => false,
                }
            }
            Self::IsNot(comparison) => {
                match (fields.get(comparison.field_id.as_str()), values.get(comparison.field_id.as_str())) {
                    (Some(field), Some(value)) => !comparison.holds_for(field, value),
                    _ => true,
                }
            }
        }
    }

    fn visit(&self, visitor: &mut impl FnMut(&Comparison)) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.visit(visitor);
                }
            }
            Self::Is(comparison) | Self::IsNot(comparison) => visitor(comparison),
        }
    }
}

impl Comparison {
    fn validate(&self, fields: &[PropertyField]) -> Result<(), RunbookError> {
        if self.field_id.is_empty() {
            return Err(invalid("field_id cannot be empty"));
        }
        let Some(field) = fields.iter().find(|field| field.id == self.field_id) else {
            return Ok(());
        };
        match field.field_type {
            PropertyFieldType::Text => {
                if self.value.is_string() {
                    Ok(())
                } else {
                    Err(invalid("text field condition value must be a string"))
                }
            }
            PropertyFieldType::Select | PropertyFieldType::Multiselect => {
                let options = string_array(&self.value)
                    .ok_or_else(|| invalid("select field condition value must be an array"))?;
                if options.is_empty() {
                    return Err(invalid("select field condition value array cannot be empty"));
                }
                if options.iter().all(|option| field.option_ids.contains(option)) {
                    Ok(())
                } else {
                    Err(invalid(
                        "condition value does not match any valid option for select field",
                    ))
                }
            }
        }
    }

    fn holds_for(&self, field: &PropertyField, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        match field.field_type {
            PropertyFieldType::Text => match (value.as_str(), self.value.as_str()) {
                (Some(actual), Some(expected)) => actual.to_lowercase() == expected.to_lowercase(),
                _ => false,
            },
            PropertyFieldType::Select => match (value.as_str(), string_array(&self.value)) {
                (Some(actual), Some(expected)) => expected.iter().any(|option| option == actual),
                _ => false,
            },
            PropertyFieldType::Multiselect => {
                match (string_array(value), string_array(&self.value)) {
                    (Some(actual), Some(expected)) => {
                        expected.iter().any(|option| actual.contains(option))
                    }
                    _ => false,
                }
            }
        }
    }
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|entry| entry.as_str().map(str::to_string))
        .collect()
}

fn invalid(message: &str) -> RunbookError {
    RunbookError::InvalidArgument(message.to_string())
}

//! Decision-table rule evaluation.
//!
//! A [`DecisionTable`] is pre-parsed, immutable rule data: an ordered list of
//! input definitions and an ordered list of rules, each rule holding one
//! [`InputEntry`] per declared input. The [`DecisionEngine`] matches the
//! rules top to bottom against supplied inputs; the first rule whose every
//! column is satisfied wins. "No rule matched" is a normal outcome
//! (`Ok(None)`), never an error.

pub mod expr;
pub mod value;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

pub use expr::ExprError;
pub use value::{RuleOperator, RuleValue, ValueError};

/// One declared input column: a label and an optional input expression.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Input {
    pub label: String,
    /// Evaluated against the named-input scope when present; takes
    /// precedence over positional and label-based resolution.
    pub expression: Option<String>,
}

impl Input {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            expression: None,
        }
    }

    pub fn with_expression(label: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            expression: Some(expression.into()),
        }
    }
}

/// A single (operator, parsed value) condition within a column entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub operator: RuleOperator,
    pub value: RuleValue,
}

impl Condition {
    pub fn new(operator: RuleOperator, value: impl Into<RuleValue>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }
}

/// One rule's conditions for one declared input. An empty condition list is
/// a wildcard: always satisfied, and the input is never resolved for it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InputEntry {
    pub conditions: Vec<Condition>,
}

impl InputEntry {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn wildcard() -> Self {
        Self::default()
    }

    pub fn is_wildcard(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// One rule output: a label and the pre-parsed value emitted on match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputEntry {
    pub label: String,
    pub value: RuleValue,
}

impl OutputEntry {
    pub fn new(label: impl Into<String>, value: impl Into<RuleValue>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// A decision-table row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    /// Positionally aligned with the table's input definitions.
    pub input_entries: Vec<InputEntry>,
    pub output_entries: Vec<OutputEntry>,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        input_entries: Vec<InputEntry>,
        output_entries: Vec<OutputEntry>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_entries,
            output_entries,
        }
    }

    /// The rule's outputs as a JSON map, ready to merge into task data.
    pub fn output_as_map(&self) -> HashMap<String, serde_json::Value> {
        self.output_entries
            .iter()
            .map(|entry| (entry.label.clone(), (&entry.value).into()))
            .collect()
    }
}

/// Immutable, pre-parsed decision table. Textual authoring formats are
/// parsed upstream; this type only ever sees the resolved structure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionTable {
    pub inputs: Vec<Input>,
    pub rules: Vec<Rule>,
}

impl DecisionTable {
    pub fn new(inputs: Vec<Input>, rules: Vec<Rule>) -> Self {
        Self { inputs, rules }
    }
}

/// A decision-table column failed to resolve or evaluate. Carries the
/// offending rule id and column index for tracing.
#[derive(Debug, Error)]
#[error("rule '{rule_id}' column {column}: {kind}")]
pub struct EvaluationError {
    pub rule_id: String,
    pub column: usize,
    #[source]
    pub kind: EvaluationErrorKind,
}

#[derive(Debug, Error)]
pub enum EvaluationErrorKind {
    #[error("no value resolvable for input '{0}'")]
    UnresolvedInput(String),
    #[error(transparent)]
    Expression(#[from] ExprError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("rule has {entries} entries but the table declares {inputs} inputs")]
    ArityMismatch { entries: usize, inputs: usize },
}

/// Evaluates a [`DecisionTable`] against supplied inputs.
pub struct DecisionEngine {
    table: DecisionTable,
}

impl DecisionEngine {
    pub fn new(table: DecisionTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &DecisionTable {
        &self.table
    }

    /// Return the first rule for which every column is satisfied, or `None`
    /// if no rule matches.
    ///
    /// Input resolution per column: (1) the input definition's expression,
    /// evaluated against `named` as the variable scope; (2) the positional
    /// input at the column's index; (3) the input's label looked up in
    /// `named`. Wildcard columns never resolve their input.
    pub fn decide<'a>(
        &'a self,
        positional: &[serde_json::Value],
        named: &HashMap<String, serde_json::Value>,
    ) -> Result<Option<&'a Rule>, EvaluationError> {
        for rule in &self.table.rules {
            debug!(rule = %rule.id, description = %rule.description, "checking rule");
            if self.check_rule(rule, positional, named)? {
                debug!(rule = %rule.id, "rule matched");
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    fn check_rule(
        &self,
        rule: &Rule,
        positional: &[serde_json::Value],
        named: &HashMap<String, serde_json::Value>,
    ) -> Result<bool, EvaluationError> {
        let tag_err = |column: usize, kind: EvaluationErrorKind| EvaluationError {
            rule_id: rule.id.clone(),
            column,
            kind,
        };

        if rule.input_entries.len() != self.table.inputs.len() {
            return Err(tag_err(
                0,
                EvaluationErrorKind::ArityMismatch {
                    entries: rule.input_entries.len(),
                    inputs: self.table.inputs.len(),
                },
            ));
        }

        for (column, entry) in rule.input_entries.iter().enumerate() {
            if entry.is_wildcard() {
                continue;
            }
            let resolved = self
                .resolve_input(column, positional, named)
                .map_err(|kind| tag_err(column, kind))?;
            for condition in &entry.conditions {
                let holds = value::compare(condition.operator, &resolved, &condition.value)
                    .map_err(|e| tag_err(column, e.into()))?;
                if !holds {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn resolve_input(
        &self,
        column: usize,
        positional: &[serde_json::Value],
        named: &HashMap<String, serde_json::Value>,
    ) -> Result<RuleValue, EvaluationErrorKind> {
        let input = &self.table.inputs[column];
        if let Some(expression) = &input.expression {
            return Ok(expr::evaluate(expression, named)?);
        }
        if let Some(value) = positional.get(column) {
            return RuleValue::try_from(value).map_err(Into::into);
        }
        match named.get(&input.label) {
            Some(value) => RuleValue::try_from(value).map_err(Into::into),
            None => Err(EvaluationErrorKind::UnresolvedInput(input.label.clone())),
        }
    }
}

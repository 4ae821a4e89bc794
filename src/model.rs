//! Canonical in-memory flag representation (the flag model, C1).
//!
//! Everything here is deserialized from the upstream's wire shape by
//! [`crate::upstream`] and otherwise never mutated in place: a refresh
//! replaces a flag's snapshot wholesale, it never patches one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{FlagrError, Result};

pub type VariantId = i64;

/// A named outcome of a flag, carrying an opaque JSON attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    pub id: VariantId,
    pub key: String,
    #[serde(default)]
    pub attachment: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    Eq,
    Neq,
    In,
    Notin,
    Matches,
    Contains,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// An atomic property predicate. Constraints within a segment are AND-combined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub property: String,
    pub operator: Operator,
    pub value: serde_json::Value,
}

/// An allocation weight from a segment to a variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distribution {
    pub percent: u32,
    pub variant_id: VariantId,
}

/// A guarded group of distributions; matches a context via constraints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub id: i64,
    pub rank: i64,
    pub rollout_percent: u32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub distributions: Vec<Distribution>,
}

/// Canonical in-memory representation of a flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flag {
    pub id: i64,
    pub key: String,
    pub enabled: bool,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub updated_at: i64,
}

impl Flag {
    pub fn variant_by_id(&self, id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Enforces the ingestion-time invariants from the design: rollout and
    /// distribution percents in range, distribution percents sum to 100,
    /// and every referenced variant id exists. A flag that fails this check
    /// must be dropped from the refresh, never evaluated.
    pub fn validate(&self) -> Result<()> {
        for segment in &self.segments {
            if segment.rollout_percent > 100 {
                return Err(FlagrError::Validation {
                    flag_key: self.key.clone(),
                    reason: format!(
                        "segment {} has rollout_percent {} out of range",
                        segment.id, segment.rollout_percent
                    ),
                });
            }
            if segment.distributions.is_empty() {
                return Err(FlagrError::Validation {
                    flag_key: self.key.clone(),
                    reason: format!("segment {} has no distributions", segment.id),
                });
            }
            let sum: u32 = segment.distributions.iter().map(|d| d.percent).sum();
            if sum != 100 {
                return Err(FlagrError::Validation {
                    flag_key: self.key.clone(),
                    reason: format!(
                        "segment {} distribution percents sum to {} not 100",
                        segment.id, sum
                    ),
                });
            }
            for distribution in &segment.distributions {
                if self.variant_by_id(distribution.variant_id).is_none() {
                    return Err(FlagrError::Validation {
                        flag_key: self.key.clone(),
                        reason: format!(
                            "segment {} distribution references unknown variant {}",
                            segment.id, distribution.variant_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A scalar evaluation-context property value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContextValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<serde_json::Value>),
}

impl ContextValue {
    pub fn as_string_form(&self) -> String {
        match self {
            ContextValue::String(s) => s.clone(),
            ContextValue::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            ContextValue::Bool(b) => b.to_string(),
            ContextValue::List(items) => serde_json::to_string(items).unwrap_or_default(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            ContextValue::String(s) => s.parse().ok(),
            ContextValue::Bool(_) | ContextValue::List(_) => None,
        }
    }
}

/// The subject of evaluation, identified by `entity_id`.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub properties: HashMap<String, ContextValue>,
}

impl EvaluationContext {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: ContextValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn entity_type_or_default(&self) -> &str {
        self.entity_type.as_deref().unwrap_or("user")
    }
}

/// The outcome of evaluating a flag against a context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub flag_id: i64,
    pub flag_key: String,
    pub segment_id: Option<i64>,
    pub variant_id: Option<VariantId>,
    pub variant_key: Option<String>,
    pub variant_attachment: HashMap<String, serde_json::Value>,
    pub evaluated_locally: bool,
    #[serde(skip, default)]
    pub evaluation_time: Duration,
    pub reason: String,
}

impl EvaluationResult {
    pub fn no_variant(flag: &Flag, evaluated_locally: bool, reason: impl Into<String>) -> Self {
        Self {
            flag_id: flag.id,
            flag_key: flag.key.clone(),
            segment_id: None,
            variant_id: None,
            variant_key: None,
            variant_attachment: HashMap::new(),
            evaluated_locally,
            evaluation_time: Duration::ZERO,
            reason: reason.into(),
        }
    }
}

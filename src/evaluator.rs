//! Constraint evaluator (C7): matches an evaluation context against a
//! flag's segments and selects a variant. Never throws to the host — any
//! internal failure (missing variant, bad regex, unsupported operator)
//! degrades to the default result with a diagnostic reason.

use tracing::debug;

use crate::model::{Constraint, ContextValue, EvaluationContext, EvaluationResult, Flag, Operator, Segment};

pub struct ConstraintEvaluator;

impl ConstraintEvaluator {
    /// Evaluates `flag` against `ctx`. Only reaches a non-default variant
    /// when the flag is enabled, has segments, and one of them matches —
    /// the local path never needs to resolve a percentage split because the
    /// strategy determiner only sends single-100%-distribution segments
    /// here.
    pub fn evaluate(flag: &Flag, ctx: &EvaluationContext) -> EvaluationResult {
        if !flag.enabled {
            let mut result = Self::default_result(flag, "flag disabled");
            result.evaluated_locally = true;
            return result;
        }
        if flag.segments.is_empty() {
            let mut result = Self::default_result(flag, "no segments");
            result.evaluated_locally = true;
            return result;
        }

        let mut ordered: Vec<&Segment> = flag.segments.iter().collect();
        ordered.sort_by_key(|s| s.rank);

        for segment in ordered {
            if Self::matches(segment, ctx) {
                let Some(distribution) = segment.distributions.first() else {
                    continue;
                };
                let Some(variant) = flag.variant_by_id(distribution.variant_id) else {
                    debug!(
                        flag_key = %flag.key,
                        variant_id = distribution.variant_id,
                        "segment distribution references unknown variant, falling back to default"
                    );
                    continue;
                };
                return EvaluationResult {
                    flag_id: flag.id,
                    flag_key: flag.key.clone(),
                    segment_id: Some(segment.id),
                    variant_id: Some(variant.id),
                    variant_key: Some(variant.key.clone()),
                    variant_attachment: variant.attachment.clone(),
                    evaluated_locally: true,
                    evaluation_time: std::time::Duration::ZERO,
                    reason: "matched segment constraints".to_string(),
                };
            }
        }

        let mut result = Self::default_result(flag, "no segments matched");
        result.evaluated_locally = true;
        result
    }

    /// The §4.2-default rule: prefer the first segment's first distribution
    /// variant, else the flag's first variant, else no variant at all.
    fn default_result(flag: &Flag, reason: &str) -> EvaluationResult {
        if let Some(segment) = flag.segments.first() {
            if let Some(distribution) = segment.distributions.first() {
                if let Some(variant) = flag.variant_by_id(distribution.variant_id) {
                    return EvaluationResult {
                        flag_id: flag.id,
                        flag_key: flag.key.clone(),
                        segment_id: None,
                        variant_id: Some(variant.id),
                        variant_key: Some(variant.key.clone()),
                        variant_attachment: variant.attachment.clone(),
                        evaluated_locally: false,
                        evaluation_time: std::time::Duration::ZERO,
                        reason: reason.to_string(),
                    };
                }
            }
        }
        if let Some(variant) = flag.variants.first() {
            return EvaluationResult {
                flag_id: flag.id,
                flag_key: flag.key.clone(),
                segment_id: None,
                variant_id: Some(variant.id),
                variant_key: Some(variant.key.clone()),
                variant_attachment: variant.attachment.clone(),
                evaluated_locally: false,
                evaluation_time: std::time::Duration::ZERO,
                reason: reason.to_string(),
            };
        }
        EvaluationResult::no_variant(flag, false, reason)
    }

    fn matches(segment: &Segment, ctx: &EvaluationContext) -> bool {
        segment
            .constraints
            .iter()
            .all(|constraint| Self::constraint_matches(constraint, ctx))
    }

    fn constraint_matches(constraint: &Constraint, ctx: &EvaluationContext) -> bool {
        let Some(value) = ctx.properties.get(&constraint.property) else {
            return false;
        };
        match constraint.operator {
            Operator::Eq => value.as_string_form() == Self::scalar_string(&constraint.value),
            Operator::Neq => value.as_string_form() != Self::scalar_string(&constraint.value),
            Operator::In => Self::in_list(&constraint.value, value),
            Operator::Notin => !Self::in_list(&constraint.value, value),
            Operator::Matches => Self::regex_matches(&constraint.value, value),
            Operator::Contains => value
                .as_string_form()
                .contains(&Self::scalar_string(&constraint.value)),
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
                Self::numeric_compare(constraint.operator, &constraint.value, value)
            }
        }
    }

    fn scalar_string(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string().trim_matches('"').to_string(),
        }
    }

    fn in_list(needle: &serde_json::Value, value: &ContextValue) -> bool {
        let Some(items) = needle.as_array() else {
            return false;
        };
        let candidate = value.as_string_form();
        items
            .iter()
            .any(|item| Self::scalar_string(item) == candidate)
    }

    fn regex_matches(pattern: &serde_json::Value, value: &ContextValue) -> bool {
        let Some(pattern) = pattern.as_str() else {
            return false;
        };
        match regex::Regex::new(pattern) {
            Ok(re) => re.is_match(&value.as_string_form()),
            Err(err) => {
                debug!(pattern, error = %err, "constraint regex failed to compile, treating as no-match");
                false
            }
        }
    }

    fn numeric_compare(operator: Operator, constraint_value: &serde_json::Value, value: &ContextValue) -> bool {
        let Some(lhs) = value.as_f64() else {
            return false;
        };
        let Some(rhs) = constraint_value.as_f64().or_else(|| {
            constraint_value
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
        }) else {
            return false;
        };
        match operator {
            Operator::Lt => lhs < rhs,
            Operator::Lte => lhs <= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Gte => lhs >= rhs,
            _ => unreachable!("numeric_compare only called for ordering operators"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Distribution, Variant};
    use std::collections::HashMap;

    fn brazil_flag() -> Flag {
        Flag {
            id: 1,
            key: "brazil_launch".into(),
            enabled: true,
            variants: vec![
                Variant { id: 1, key: "enabled".into(), attachment: HashMap::new() },
                Variant { id: 2, key: "disabled".into(), attachment: HashMap::new() },
            ],
            segments: vec![Segment {
                id: 1,
                rank: 0,
                rollout_percent: 100,
                constraints: vec![Constraint {
                    property: "country".into(),
                    operator: Operator::Eq,
                    value: serde_json::json!("BR"),
                }],
                distributions: vec![Distribution { percent: 100, variant_id: 1 }],
            }],
            updated_at: 0,
        }
    }

    fn ctx(country: &str) -> EvaluationContext {
        EvaluationContext::new("user-1")
            .with_property("country", ContextValue::String(country.to_string()))
    }

    #[test]
    fn regional_always_on_matches() {
        let result = ConstraintEvaluator::evaluate(&brazil_flag(), &ctx("BR"));
        assert_eq!(result.variant_key.as_deref(), Some("enabled"));
        assert!(result.evaluated_locally);
    }

    #[test]
    fn regional_always_on_falls_through_to_default() {
        let result = ConstraintEvaluator::evaluate(&brazil_flag(), &ctx("US"));
        assert_eq!(result.reason, "no segments matched");
        assert_eq!(result.segment_id, None);
    }

    #[test]
    fn entity_id_does_not_affect_local_result() {
        let flag = brazil_flag();
        let ctx_a = EvaluationContext::new("user-a")
            .with_property("country", ContextValue::String("BR".into()));
        let ctx_b = EvaluationContext::new("user-b")
            .with_property("country", ContextValue::String("BR".into()));
        assert_eq!(
            ConstraintEvaluator::evaluate(&flag, &ctx_a).variant_key,
            ConstraintEvaluator::evaluate(&flag, &ctx_b).variant_key
        );
    }

    #[test]
    fn disabled_flag_never_matches_segments() {
        let mut flag = brazil_flag();
        flag.enabled = false;
        let result = ConstraintEvaluator::evaluate(&flag, &ctx("BR"));
        assert!(result.reason.contains("disabled"));
    }

    #[test]
    fn missing_property_fails_constraint() {
        let flag = brazil_flag();
        let ctx = EvaluationContext::new("user-1");
        let result = ConstraintEvaluator::evaluate(&flag, &ctx);
        assert_eq!(result.reason, "no segments matched");
    }

    #[test]
    fn in_operator_checks_membership() {
        let mut flag = brazil_flag();
        flag.segments[0].constraints[0] = Constraint {
            property: "country".into(),
            operator: Operator::In,
            value: serde_json::json!(["BR", "AR", "CL"]),
        };
        assert_eq!(
            ConstraintEvaluator::evaluate(&flag, &ctx("AR")).variant_key.as_deref(),
            Some("enabled")
        );
        assert_eq!(
            ConstraintEvaluator::evaluate(&flag, &ctx("US")).reason,
            "no segments matched"
        );
    }

    #[test]
    fn matches_operator_applies_regex() {
        let mut flag = brazil_flag();
        flag.segments[0].constraints[0] = Constraint {
            property: "country".into(),
            operator: Operator::Matches,
            value: serde_json::json!("^B."),
        };
        assert_eq!(
            ConstraintEvaluator::evaluate(&flag, &ctx("BR")).variant_key.as_deref(),
            Some("enabled")
        );
    }

    #[test]
    fn invalid_regex_is_treated_as_no_match_not_a_panic() {
        let mut flag = brazil_flag();
        flag.segments[0].constraints[0] = Constraint {
            property: "country".into(),
            operator: Operator::Matches,
            value: serde_json::json!("("),
        };
        let result = ConstraintEvaluator::evaluate(&flag, &ctx("BR"));
        assert_eq!(result.reason, "no segments matched");
    }

    #[test]
    fn numeric_comparison_uses_f64_conversion() {
        let mut flag = brazil_flag();
        flag.segments[0].constraints[0] = Constraint {
            property: "age".into(),
            operator: Operator::Gte,
            value: serde_json::json!(18),
        };
        let ctx = EvaluationContext::new("u").with_property("age", ContextValue::Number(21.0));
        assert_eq!(
            ConstraintEvaluator::evaluate(&flag, &ctx).variant_key.as_deref(),
            Some("enabled")
        );
    }

    #[test]
    fn segments_evaluated_in_rank_order() {
        let mut flag = brazil_flag();
        flag.segments.push(Segment {
            id: 2,
            rank: -1,
            rollout_percent: 100,
            constraints: vec![],
            distributions: vec![Distribution { percent: 100, variant_id: 2 }],
        });
        // rank -1 (catch-all) sorts before rank 0 (BR-only), so it wins even
        // for a BR context.
        let result = ConstraintEvaluator::evaluate(&flag, &ctx("BR"));
        assert_eq!(result.variant_key.as_deref(), Some("disabled"));
    }
}

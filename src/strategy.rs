//! Strategy determiner (C6): classifies a flag as locally evaluable or
//! remote-required without guessing at the upstream's hashing function. See
//! the design notes: any flag whose entry decision depends on stable
//! bucketing into a sub-100% slice must be delegated.

use crate::model::Flag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Local,
    Remote,
}

/// Classifies `flag`, applying the rules in declared segment order and
/// returning a human-readable reason alongside the decision.
pub fn determine(flag: &Flag) -> (Strategy, &'static str) {
    if !flag.enabled {
        return (Strategy::Local, "disabled");
    }
    if flag.segments.is_empty() {
        return (Strategy::Local, "default only");
    }
    for segment in &flag.segments {
        if segment.rollout_percent > 0 && segment.rollout_percent < 100 {
            return (Strategy::Remote, "partial rollout needs sticky bucketing");
        }
        if segment.distributions.len() > 1 {
            return (Strategy::Remote, "multi-variant split");
        }
        if let [only] = segment.distributions.as_slice() {
            if only.percent < 100 {
                return (Strategy::Remote, "percentage distribution");
            }
        }
    }
    (Strategy::Local, "deterministic on constraints")
}

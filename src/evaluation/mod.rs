//! Pluggable scoring of model outputs.

pub mod builtin;
pub mod evaluator;
pub mod judge;
pub mod similarity;

pub use evaluator::{BuildContext, EvalContext, EvaluatorRegistry, ResolvedEvaluator};

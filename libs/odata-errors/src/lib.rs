//! Problem documents and the error catalog used by every OData crate.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod catalog;
pub mod problem;

pub use catalog::ErrDef;
pub use problem::{APPLICATION_PROBLEM_JSON, Problem, ValidationViolation};

/// Attach the request path and trace id to a problem on its way out.
pub fn finalize(problem: Problem, instance: &str, trace_id: Option<String>) -> Problem {
    problem.at(instance, trace_id)
}

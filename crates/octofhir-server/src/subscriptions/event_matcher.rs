//! Criteria evaluation against written resources.
//!
//! Matching is pure: the matcher reads the resource's search-parameter
//! values and compares them to the criteria. Reference and token values
//! compare by exact string equality. Unknown parameters yield no values and
//! therefore never match.

use octofhir_core::SearchParameterSource;

use super::criteria::{Constraint, Criteria};

#[derive(Debug, Clone, Copy, Default)]
pub struct EventMatcher;

impl EventMatcher {
    pub fn new() -> Self {
        Self
    }

    /// True when `resource` is of the criteria's type and satisfies every
    /// constraint.
    pub fn evaluate(&self, resource: &dyn SearchParameterSource, criteria: &Criteria) -> bool {
        if resource.resource_type() != criteria.resource_type() {
            return false;
        }
        criteria
            .constraints()
            .iter()
            .all(|constraint| self.constraint_matches(resource, constraint))
    }

    fn constraint_matches(&self, resource: &dyn SearchParameterSource, constraint: &Constraint) -> bool {
        let values = resource.search_parameter_values(&constraint.name);
        let matched = values
            .iter()
            .any(|value| constraint.values.iter().any(|expected| expected == value));

        tracing::trace!(
            param = %constraint.name,
            resource_values = values.len(),
            matched,
            "Evaluated criteria constraint"
        );
        matched
    }
}

//! Search parameter value extraction.
//!
//! Resources expose named, possibly multi-valued search parameter values
//! through [`SearchParameterSource`]. [`IndexedResource`] implements it over
//! FHIR JSON with a [`SearchParamCatalog`] that maps `(resource type, code)`
//! to a FHIRPath-like expression, so callers never hard-code per-type logic.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::CoreError;
use crate::fhir_reference::normalize_reference;

/// Capability exposed by resources for criteria matching.
pub trait SearchParameterSource {
    /// FHIR resource type (e.g. "Observation").
    fn resource_type(&self) -> &str;

    /// Logical id, once the resource has one.
    fn resource_id(&self) -> Option<&str>;

    /// All values of the named search parameter, in document order.
    ///
    /// Unknown parameters yield an empty list.
    fn search_parameter_values(&self, name: &str) -> Vec<String>;
}

/// Search parameter types that have value extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchParamType {
    Reference,
    Token,
    String,
    Uri,
}

/// A search parameter definition: which values of a resource a code names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParamDefinition {
    /// Resource type the parameter is defined on ("Resource" for all types)
    pub base: String,
    pub code: String,
    pub param_type: SearchParamType,
    pub expression: String,
}

impl SearchParamDefinition {
    pub fn new(
        base: impl Into<String>,
        code: impl Into<String>,
        param_type: SearchParamType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            base: base.into(),
            code: code.into(),
            param_type,
            expression: expression.into(),
        }
    }
}

const DEFAULT_DEFINITIONS: &[(&str, &str, SearchParamType, &str)] = {
    use SearchParamType::*;
    &[
        ("Resource", "_id", Token, "Resource.id"),
        ("Resource", "_tag", Token, "Resource.meta.tag"),
        ("Resource", "_profile", Uri, "Resource.meta.profile"),
        ("Resource", "_security", Token, "Resource.meta.security"),
        ("Observation", "subject", Reference, "Observation.subject"),
        ("Observation", "patient", Reference, "Observation.subject.where(resolve() is Patient)"),
        ("Observation", "code", Token, "Observation.code"),
        ("Observation", "status", Token, "Observation.status"),
        ("Observation", "category", Token, "Observation.category"),
        ("Observation", "encounter", Reference, "Observation.encounter"),
        ("Observation", "performer", Reference, "Observation.performer"),
        ("Observation", "device", Reference, "Observation.device"),
        ("Observation", "identifier", Token, "Observation.identifier"),
        ("Observation", "value-concept", Token, "(Observation.value as CodeableConcept)"),
        ("Patient", "identifier", Token, "Patient.identifier"),
        ("Patient", "gender", Token, "Patient.gender"),
        ("Patient", "active", Token, "Patient.active"),
        ("Patient", "name", String, "Patient.name"),
        ("Patient", "family", String, "Patient.name.family"),
        ("Patient", "given", String, "Patient.name.given"),
        ("Patient", "organization", Reference, "Patient.managingOrganization"),
        ("Patient", "general-practitioner", Reference, "Patient.generalPractitioner"),
        ("Encounter", "subject", Reference, "Encounter.subject"),
        ("Encounter", "patient", Reference, "Encounter.subject.where(resolve() is Patient)"),
        ("Encounter", "status", Token, "Encounter.status"),
        ("Encounter", "class", Token, "Encounter.class"),
        ("Encounter", "type", Token, "Encounter.type"),
        ("Condition", "subject", Reference, "Condition.subject"),
        ("Condition", "patient", Reference, "Condition.subject.where(resolve() is Patient)"),
        ("Condition", "code", Token, "Condition.code"),
        ("Condition", "clinical-status", Token, "Condition.clinicalStatus"),
        ("Condition", "category", Token, "Condition.category"),
        ("DiagnosticReport", "subject", Reference, "DiagnosticReport.subject"),
        ("DiagnosticReport", "patient", Reference, "DiagnosticReport.subject.where(resolve() is Patient)"),
        ("DiagnosticReport", "code", Token, "DiagnosticReport.code"),
        ("DiagnosticReport", "status", Token, "DiagnosticReport.status"),
        ("DiagnosticReport", "result", Reference, "DiagnosticReport.result"),
        ("MedicationRequest", "subject", Reference, "MedicationRequest.subject"),
        ("MedicationRequest", "patient", Reference, "MedicationRequest.subject.where(resolve() is Patient)"),
        ("MedicationRequest", "status", Token, "MedicationRequest.status"),
        ("MedicationRequest", "intent", Token, "MedicationRequest.intent"),
        ("MedicationRequest", "code", Token, "(MedicationRequest.medication as CodeableConcept)"),
        ("MedicationRequest", "medication", Reference, "(MedicationRequest.medication as Reference)"),
        ("Procedure", "subject", Reference, "Procedure.subject"),
        ("Procedure", "patient", Reference, "Procedure.subject.where(resolve() is Patient)"),
        ("Procedure", "code", Token, "Procedure.code"),
        ("Procedure", "status", Token, "Procedure.status"),
        ("AllergyIntolerance", "patient", Reference, "AllergyIntolerance.patient"),
        ("AllergyIntolerance", "code", Token, "AllergyIntolerance.code"),
        ("Immunization", "patient", Reference, "Immunization.patient"),
        ("Immunization", "vaccine-code", Token, "Immunization.vaccineCode"),
        ("Practitioner", "identifier", Token, "Practitioner.identifier"),
        ("Practitioner", "name", String, "Practitioner.name"),
        ("Organization", "identifier", Token, "Organization.identifier"),
        ("Organization", "name", String, "Organization.name"),
        ("Subscription", "status", Token, "Subscription.status"),
        ("Subscription", "criteria", String, "Subscription.criteria"),
        ("Subscription", "type", Token, "Subscription.channel.type"),
    ]
};

/// Catalog of search parameter definitions keyed by resource type and code.
#[derive(Debug, Clone, Default)]
pub struct SearchParamCatalog {
    definitions: HashMap<(String, String), SearchParamDefinition>,
}

impl SearchParamCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the common clinical parameters.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for (base, code, param_type, expression) in DEFAULT_DEFINITIONS {
            catalog.add(SearchParamDefinition::new(*base, *code, *param_type, *expression));
        }
        catalog
    }

    /// Add or replace a definition.
    pub fn add(&mut self, definition: SearchParamDefinition) {
        self.definitions.insert(
            (definition.base.clone(), definition.code.clone()),
            definition,
        );
    }

    /// Look up a parameter for a resource type, falling back to `Resource`.
    pub fn get(&self, resource_type: &str, code: &str) -> Option<&SearchParamDefinition> {
        self.definitions
            .get(&(resource_type.to_string(), code.to_string()))
            .or_else(|| {
                self.definitions
                    .get(&("Resource".to_string(), code.to_string()))
            })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// A FHIR JSON resource viewed through a search parameter catalog.
#[derive(Debug, Clone, Copy)]
pub struct IndexedResource<'a> {
    resource: &'a Value,
    resource_type: &'a str,
    catalog: &'a SearchParamCatalog,
    base_url: Option<&'a str>,
}

impl<'a> IndexedResource<'a> {
    /// Wrap a resource; it must carry a string `resourceType`.
    pub fn new(resource: &'a Value, catalog: &'a SearchParamCatalog) -> Result<Self, CoreError> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::invalid_resource("missing resourceType"))?;
        Ok(Self {
            resource,
            resource_type,
            catalog,
            base_url: None,
        })
    }

    /// Treat absolute references under `base_url` as local.
    pub fn with_base_url(mut self, base_url: Option<&'a str>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn json(&self) -> &'a Value {
        self.resource
    }
}

impl SearchParameterSource for IndexedResource<'_> {
    fn resource_type(&self) -> &str {
        self.resource_type
    }

    fn resource_id(&self) -> Option<&str> {
        self.resource.get("id").and_then(Value::as_str)
    }

    fn search_parameter_values(&self, name: &str) -> Vec<String> {
        let Some(definition) = self.catalog.get(self.resource_type, name) else {
            return Vec::new();
        };
        extract_values(
            self.resource,
            self.resource_type,
            definition.param_type,
            &definition.expression,
            self.base_url,
        )
    }
}

/// Extract the values a search parameter expression selects from a resource.
pub fn extract_values(
    resource: &Value,
    resource_type: &str,
    param_type: SearchParamType,
    expression: &str,
    base_url: Option<&str>,
) -> Vec<String> {
    let segments = fhirpath_to_segments(expression, resource_type);
    if segments.is_empty() {
        return Vec::new();
    }
    let target_type = resolve_target_type(select_branch(expression, resource_type));

    let mut nodes = Vec::new();
    navigate_json(resource, &segments, 0, &mut nodes);

    let mut out = Vec::new();
    for node in nodes {
        match param_type {
            SearchParamType::Reference => reference_values(node, base_url, target_type, &mut out),
            SearchParamType::Token => token_values(node, &mut out),
            SearchParamType::String => string_values(node, &mut out),
            SearchParamType::Uri => {
                if let Some(s) = node.as_str() {
                    out.push(s.to_string());
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    out.retain(|v| !v.is_empty() && seen.insert(v.clone()));
    out
}

// ============================================================================
// Per-type value extraction
// ============================================================================

/// Push the normalized and raw forms of a reference. With `target_type`,
/// references to any other resource type are skipped.
fn reference_values(
    node: &Value,
    base_url: Option<&str>,
    target_type: Option<&str>,
    out: &mut Vec<String>,
) {
    let raw = match node {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("reference").and_then(Value::as_str),
        _ => None,
    };
    let Some(raw) = raw else {
        return;
    };
    if let Some(target) = target_type
        && referenced_type(raw) != Some(target)
    {
        return;
    }
    if let Some(relative) = normalize_reference(raw, base_url) {
        out.push(relative);
    }
    out.push(raw.to_string());
}

/// Resource type named by a `Type/id` reference, relative or absolute.
fn referenced_type(reference: &str) -> Option<&str> {
    let path = reference.split("/_history/").next().unwrap_or(reference);
    let mut parts = path.rsplit('/');
    parts.next().filter(|id| !id.is_empty())?;
    parts
        .next()
        .filter(|t| t.starts_with(|c: char| c.is_ascii_uppercase()))
}

fn token_values(node: &Value, out: &mut Vec<String>) {
    match node {
        Value::String(s) => out.push(s.clone()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Object(obj) => {
            if let Some(codings) = obj.get("coding").and_then(Value::as_array) {
                for coding in codings {
                    push_system_value(coding, "code", out);
                }
            } else if obj.contains_key("code") {
                push_system_value(node, "code", out);
            } else if obj.contains_key("value") {
                // Identifier / ContactPoint
                push_system_value(node, "value", out);
            }
        }
        _ => {}
    }
}

fn push_system_value(node: &Value, value_key: &str, out: &mut Vec<String>) {
    let Some(value) = node.get(value_key).and_then(Value::as_str) else {
        return;
    };
    out.push(value.to_string());
    match node.get("system").and_then(Value::as_str) {
        Some(system) => out.push(format!("{system}|{value}")),
        None => out.push(format!("|{value}")),
    }
}

fn string_values(node: &Value, out: &mut Vec<String>) {
    match node {
        Value::String(s) => out.push(s.clone()),
        Value::Object(obj) => {
            // HumanName
            if let Some(family) = obj.get("family").and_then(Value::as_str) {
                out.push(family.to_string());
            }
            if let Some(given) = obj.get("given").and_then(Value::as_array) {
                out.extend(given.iter().filter_map(Value::as_str).map(String::from));
            }
            for field in ["text", "name", "city", "state", "country", "postalCode"] {
                if let Some(s) = obj.get(field).and_then(Value::as_str) {
                    out.push(s.to_string());
                }
            }
            if let Some(lines) = obj.get("line").and_then(Value::as_array) {
                out.extend(lines.iter().filter_map(Value::as_str).map(String::from));
            }
        }
        _ => {}
    }
}

// ============================================================================
// JSON Navigation Helpers
// ============================================================================

/// Convert a FHIRPath expression to JSON path segments.
///
/// Handles the shapes used by search parameter definitions:
/// `Observation.subject`, `Patient.name.family`,
/// `Observation.subject.where(resolve() is Patient)` and
/// `(Observation.value as CodeableConcept)`.
fn fhirpath_to_segments(expression: &str, resource_type: &str) -> Vec<String> {
    let own_prefix = format!("{resource_type}.");
    let expr = select_branch(expression, resource_type);

    // `(X.value as Type)` becomes the polymorphic `X.valueType`
    let (expr, cast) = match expr.find(" as ") {
        Some(idx) => (
            expr[..idx].trim().trim_start_matches('('),
            Some(expr[idx + 4..].trim().trim_end_matches(')')),
        ),
        None => (expr, None),
    };

    let expr = expr
        .strip_prefix(own_prefix.as_str())
        .or_else(|| expr.strip_prefix("Resource."))
        .or_else(|| expr.strip_prefix("DomainResource."))
        .unwrap_or(expr);

    let expr = strip_fhirpath_functions(expr);

    let mut segments: Vec<String> = expr
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('[') {
            Some((name, _)) => name.to_string(),
            None => s.to_string(),
        })
        .collect();

    if let (Some(cast), Some(last)) = (cast, segments.last_mut()) {
        last.push_str(cast);
    }
    segments
}

/// Union expressions: pick the branch for our resource type.
fn select_branch<'e>(expression: &'e str, resource_type: &str) -> &'e str {
    let own_prefix = format!("{resource_type}.");
    expression
        .split('|')
        .map(str::trim)
        .find(|s| s.trim_start_matches('(').starts_with(&own_prefix))
        .or_else(|| expression.split('|').next().map(str::trim))
        .unwrap_or(expression)
}

/// The `Type` of a `where(resolve() is Type)` filter.
fn resolve_target_type(expression: &str) -> Option<&str> {
    const MARKER: &str = "resolve() is ";
    let start = expression.find(MARKER)? + MARKER.len();
    let rest = &expression[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    Some(&rest[..end]).filter(|t| !t.is_empty())
}

/// Strip FHIRPath function calls, keeping property paths.
fn strip_fhirpath_functions(expr: &str) -> String {
    let mut result = String::with_capacity(expr.len());
    let mut depth = 0usize;

    for c in expr.chars() {
        match c {
            '(' => {
                if depth == 0 {
                    match result.rfind('.') {
                        Some(dot) if is_fhirpath_function(&result[dot + 1..]) => {
                            result.truncate(dot)
                        }
                        None if is_fhirpath_function(&result) => result.clear(),
                        _ => {}
                    }
                }
                depth += 1;
            }
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => result.push(c),
            _ => {}
        }
    }

    result.trim_matches('.').to_string()
}

fn is_fhirpath_function(name: &str) -> bool {
    matches!(
        name,
        "where"
            | "resolve"
            | "ofType"
            | "exists"
            | "empty"
            | "first"
            | "last"
            | "as"
            | "is"
            | "not"
            | "all"
            | "any"
            | "distinct"
    )
}

/// Navigate JSON following path segments, collecting leaf values.
///
/// Arrays are iterated transparently; a segment without an exact key also
/// matches FHIR polymorphic names (`effective` -> `effectiveDateTime`).
fn navigate_json<'a>(
    value: &'a Value,
    segments: &[String],
    depth: usize,
    results: &mut Vec<&'a Value>,
) {
    if depth >= segments.len() {
        match value {
            Value::Array(items) => results.extend(items.iter()),
            Value::Null => {}
            _ => results.push(value),
        }
        return;
    }

    let segment = segments[depth].as_str();
    match value {
        Value::Object(obj) => {
            if let Some(child) = obj.get(segment) {
                navigate_json(child, segments, depth + 1, results);
            } else {
                for (key, child) in obj {
                    if key.len() > segment.len()
                        && key.starts_with(segment)
                        && key.as_bytes()[segment.len()].is_ascii_uppercase()
                    {
                        navigate_json(child, segments, depth + 1, results);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                navigate_json(item, segments, depth, results);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(resource: &Value, name: &str) -> Vec<String> {
        let catalog = SearchParamCatalog::with_defaults();
        IndexedResource::new(resource, &catalog)
            .unwrap()
            .search_parameter_values(name)
    }

    #[test]
    fn test_reference_values() {
        let obs = json!({
            "resourceType": "Observation",
            "id": "obs-1",
            "subject": { "reference": "Patient/1/_history/2" }
        });
        assert_eq!(
            values(&obs, "subject"),
            vec!["Patient/1", "Patient/1/_history/2"]
        );
        assert_eq!(values(&obs, "patient")[0], "Patient/1");
    }

    #[test]
    fn test_patient_parameter_keeps_only_patient_references() {
        let group_subject = json!({
            "resourceType": "Observation",
            "subject": { "reference": "Group/1" }
        });
        assert_eq!(values(&group_subject, "subject"), vec!["Group/1"]);
        assert!(values(&group_subject, "patient").is_empty());

        let absolute = json!({
            "resourceType": "Encounter",
            "subject": { "reference": "http://other.org/fhir/Patient/7/_history/1" }
        });
        assert_eq!(
            values(&absolute, "patient"),
            vec!["http://other.org/fhir/Patient/7/_history/1"]
        );

        let contained = json!({
            "resourceType": "Condition",
            "subject": { "reference": "#p1" }
        });
        assert!(values(&contained, "patient").is_empty());
    }

    #[test]
    fn test_resolve_target_type() {
        assert_eq!(
            resolve_target_type("Observation.subject.where(resolve() is Patient)"),
            Some("Patient")
        );
        assert_eq!(resolve_target_type("Observation.subject"), None);
        assert_eq!(referenced_type("Patient/1/_history/2"), Some("Patient"));
        assert_eq!(referenced_type("http://x.org/fhir/Group/g"), Some("Group"));
        assert_eq!(referenced_type("#p1"), None);
    }

    #[test]
    fn test_reference_array() {
        let obs = json!({
            "resourceType": "Observation",
            "performer": [
                { "reference": "Practitioner/456" },
                { "reference": "Organization/789" }
            ]
        });
        assert_eq!(
            values(&obs, "performer"),
            vec!["Practitioner/456", "Organization/789"]
        );
    }

    #[test]
    fn test_absolute_reference_on_base() {
        let obs = json!({
            "resourceType": "Observation",
            "subject": { "reference": "http://localhost:8080/fhir/Patient/1" }
        });
        let catalog = SearchParamCatalog::with_defaults();
        let indexed = IndexedResource::new(&obs, &catalog)
            .unwrap()
            .with_base_url(Some("http://localhost:8080/fhir"));
        assert!(
            indexed
                .search_parameter_values("subject")
                .contains(&"Patient/1".to_string())
        );
    }

    #[test]
    fn test_token_values() {
        let obs = json!({
            "resourceType": "Observation",
            "status": "final",
            "code": { "coding": [{ "system": "SNOMED-CT", "code": "82313006" }] }
        });
        assert_eq!(values(&obs, "status"), vec!["final"]);
        assert_eq!(
            values(&obs, "code"),
            vec!["82313006", "SNOMED-CT|82313006"]
        );
    }

    #[test]
    fn test_identifier_and_boolean_tokens() {
        let patient = json!({
            "resourceType": "Patient",
            "id": "1",
            "active": true,
            "identifier": [{ "system": "http://cognitivemedicine.com/lpi", "value": "1" }],
            "meta": { "tag": [{ "code": "LPI-FHIR" }] }
        });
        assert_eq!(values(&patient, "active"), vec!["true"]);
        assert_eq!(
            values(&patient, "identifier"),
            vec!["1", "http://cognitivemedicine.com/lpi|1"]
        );
        assert_eq!(values(&patient, "_id"), vec!["1"]);
        assert_eq!(values(&patient, "_tag"), vec!["LPI-FHIR", "|LPI-FHIR"]);
    }

    #[test]
    fn test_string_values() {
        let patient = json!({
            "resourceType": "Patient",
            "name": [{ "family": "Smith", "given": ["John", "James"] }]
        });
        assert_eq!(values(&patient, "name"), vec!["Smith", "John", "James"]);
        assert_eq!(values(&patient, "given"), vec!["John", "James"]);
    }

    #[test]
    fn test_polymorphic_cast() {
        let req = json!({
            "resourceType": "MedicationRequest",
            "medicationReference": { "reference": "Medication/5" }
        });
        assert_eq!(values(&req, "medication")[0], "Medication/5");
        assert!(values(&req, "code").is_empty());
    }

    #[test]
    fn test_unknown_parameter_is_empty() {
        let obs = json!({ "resourceType": "Observation", "status": "final" });
        assert!(values(&obs, "no-such-param").is_empty());
        // defined on another type only
        assert!(values(&obs, "gender").is_empty());
    }

    #[test]
    fn test_missing_resource_type() {
        let catalog = SearchParamCatalog::with_defaults();
        let value = json!({ "id": "1" });
        assert!(IndexedResource::new(&value, &catalog).is_err());
    }

    #[test]
    fn test_fhirpath_to_segments() {
        assert_eq!(
            fhirpath_to_segments("Observation.subject", "Observation"),
            vec!["subject"]
        );
        assert_eq!(
            fhirpath_to_segments("Patient.name.family", "Patient"),
            vec!["name", "family"]
        );
        assert_eq!(
            fhirpath_to_segments(
                "Observation.subject.where(resolve() is Patient)",
                "Observation"
            ),
            vec!["subject"]
        );
        assert_eq!(
            fhirpath_to_segments("(Observation.value as CodeableConcept)", "Observation"),
            vec!["valueCodeableConcept"]
        );
        assert_eq!(
            fhirpath_to_segments("Resource.meta.tag", "Patient"),
            vec!["meta", "tag"]
        );
    }
}

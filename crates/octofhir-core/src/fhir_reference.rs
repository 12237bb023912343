//! FHIR Reference parsing utilities.
//!
//! Subscription criteria compare reference parameters as relative
//! `Type/id` strings, so every reference found in a resource is normalised
//! to that form before matching.
//!
//! # Reference Formats
//!
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1`
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//! - Contained: `#contained-id`
//! - URN: `urn:uuid:xxx`
//!
//! # Example
//!
//! ```
//! use octofhir_core::fhir_reference::parse_reference;
//!
//! let reference = parse_reference("Patient/123/_history/2", None).unwrap();
//! assert_eq!(reference.resource_type, "Patient");
//! assert_eq!(reference.id, "123");
//! assert_eq!(reference.version.as_deref(), Some("2"));
//! ```

use std::fmt;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    pub resource_type: String,
    pub id: String,
    /// Version from a `_history` suffix
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// Represents a reference that cannot be resolved locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    Contained(String),
    Urn(String),
    /// Absolute URL on another server (or no base URL configured)
    External(String),
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::External(url) => write!(f, "external reference: {url}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parse a FHIR reference string into its components.
///
/// Absolute URLs are only accepted when they start with `base_url`; the
/// base is stripped and the remainder parsed as a relative reference.
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid("empty reference".into()));
    }
    if let Some(contained) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained.to_string()));
    }
    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    let path = if reference.contains("://") {
        base_url
            .map(|base| base.trim_end_matches('/'))
            .and_then(|base| reference.strip_prefix(base))
            .map(|rest| rest.trim_start_matches('/'))
            .ok_or_else(|| UnresolvableReference::External(reference.to_string()))?
    } else {
        reference
    };

    let mut parts = path.split('/');
    let (Some(resource_type), Some(id)) = (parts.next(), parts.next()) else {
        return Err(UnresolvableReference::Invalid(format!(
            "reference must contain at least Type/id: {reference}"
        )));
    };

    if !resource_type.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Err(UnresolvableReference::Invalid(format!(
            "resource type must start with uppercase letter: {resource_type}"
        )));
    }
    if id.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "resource id cannot be empty".into(),
        ));
    }

    let version = match (parts.next(), parts.next()) {
        (Some("_history"), Some(v)) if !v.is_empty() => Some(v.to_string()),
        _ => None,
    };

    Ok(FhirReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
        version,
    })
}

/// Normalise a reference to its relative `Type/id` form, if it is local.
pub fn normalize_reference(reference: &str, base_url: Option<&str>) -> Option<String> {
    parse_reference(reference, base_url)
        .ok()
        .map(|r| r.to_relative())
}

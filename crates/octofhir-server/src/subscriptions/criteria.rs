//! Subscription criteria: `<ResourceType>?<name>=<value>&...`.
//!
//! A value may list alternatives separated by unescaped commas; any one of
//! them satisfies the constraint. A backslash escapes the next character, so
//! `\,` `\|` `\$` and `\\` stand for the literal characters.

use std::fmt;
use std::str::FromStr;

use octofhir_core::fhir::is_known_resource_type;
use thiserror::Error;

/// Parameters that shape a search result and carry no filter meaning.
const RESULT_PARAMETERS: &[&str] = &[
    "_format", "_pretty", "_summary", "_elements", "_count", "_sort",
];

/// Characters [`escape_value`] prefixes with a backslash.
const ESCAPED: &[char] = &['\\', ',', '$', '|'];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CriteriaError {
    #[error("criteria is empty")]
    Empty,

    #[error("unknown resource type '{0}'")]
    UnknownResourceType(String),

    #[error("parameter '{0}' has no '=' separator")]
    MissingSeparator(String),

    #[error("invalid parameter name '{0}'")]
    InvalidName(String),

    #[error("parameter '{0}' has no value")]
    EmptyValue(String),

    #[error("parameter '{name}' is not valid percent-encoding: {message}")]
    Encoding { name: String, message: String },
}

/// One filter constraint. Matches when the resource has a value equal to
/// any of `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub name: String,
    pub values: Vec<String>,
}

/// Parsed subscription criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
    resource_type: String,
    constraints: Vec<Constraint>,
    result_parameters: Vec<(String, String)>,
}

impl Criteria {
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Filter constraints, in the order they were written.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// `_format`, `_pretty` and similar parameters kept for display only.
    pub fn result_parameters(&self) -> &[(String, String)] {
        &self.result_parameters
    }

    pub fn is_bare_type(&self) -> bool {
        self.constraints.is_empty()
    }
}

impl FromStr for Criteria {
    type Err = CriteriaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CriteriaError::Empty);
        }

        let (resource_type, query) = match s.split_once('?') {
            Some((t, q)) => (t, q),
            None => (s, ""),
        };
        if !is_known_resource_type(resource_type) {
            return Err(CriteriaError::UnknownResourceType(resource_type.to_string()));
        }

        let mut constraints = Vec::new();
        let mut result_parameters = Vec::new();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_name, raw_value) = pair
                .split_once('=')
                .ok_or_else(|| CriteriaError::MissingSeparator(pair.to_string()))?;

            let name = percent_decode(raw_name, raw_name)?;
            if !is_valid_name(&name) {
                return Err(CriteriaError::InvalidName(name));
            }
            let value = percent_decode(&name, raw_value)?;
            if value.is_empty() {
                return Err(CriteriaError::EmptyValue(name));
            }

            if RESULT_PARAMETERS.contains(&name.as_str()) {
                result_parameters.push((name, value));
                continue;
            }

            let values = split_alternatives(&value);
            if values.is_empty() {
                return Err(CriteriaError::EmptyValue(name));
            }
            constraints.push(Constraint { name, values });
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            constraints,
            result_parameters,
        })
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_type)?;
        let constraints = self.constraints.iter().map(|c| {
            let values: Vec<String> = c.values.iter().map(|v| render_value(v)).collect();
            (c.name.as_str(), values.join(","))
        });
        let results = self
            .result_parameters
            .iter()
            .map(|(n, v)| (n.as_str(), render_value(v)));

        let mut sep = '?';
        for (name, value) in constraints.chain(results) {
            write!(f, "{sep}{name}={value}")?;
            sep = '&';
        }
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

fn percent_decode(name: &str, raw: &str) -> Result<String, CriteriaError> {
    urlencoding::decode(raw)
        .map(|v| v.into_owned())
        .map_err(|e| CriteriaError::Encoding {
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// Split on unescaped commas, resolving escapes and dropping blank entries.
fn split_alternatives(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => current.push(next),
                None => current.push('\\'),
            },
            ',' => {
                if !current.trim().is_empty() {
                    out.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Canonical rendering: escape what the parser would split on, percent-encode
/// what would end the parameter.
fn render_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '#' => out.push_str("%23"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a single search value so that `\ , $ |` are taken literally.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if ESCAPED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inverse of [`escape_value`].
pub fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Builds criteria strings, escaping each value and joining alternatives
/// with commas.
#[derive(Debug, Clone)]
pub struct CriteriaBuilder {
    resource_type: String,
    params: Vec<(String, String)>,
}

impl CriteriaBuilder {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter matching any of `values`. Blank values are skipped;
    /// a parameter with no remaining values is left out.
    pub fn param<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<str>,
    {
        let joined = values
            .into_iter()
            .filter(|v| !v.as_ref().trim().is_empty())
            .map(|v| escape_value(v.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        if !joined.is_empty() {
            self.params.push((name.into(), joined));
        }
        self
    }

    /// The criteria string, with values percent-encoded for use in a URL.
    pub fn to_query_string(&self) -> String {
        let mut out = self.resource_type.clone();
        let mut sep = '?';
        for (name, value) in &self.params {
            out.push(sep);
            out.push_str(name);
            out.push('=');
            out.push_str(&urlencoding::encode(value));
            sep = '&';
        }
        out
    }

    pub fn build(&self) -> Result<Criteria, CriteriaError> {
        self.to_query_string().parse()
    }
}

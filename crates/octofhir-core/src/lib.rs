pub mod error;
pub mod events;
pub mod fhir;
pub mod fhir_reference;
pub mod id;
pub mod search_index;

pub use error::{CoreError, ErrorCategory, Result};
pub use fhir::{is_known_resource_type, validate_resource_type};
pub use fhir_reference::{FhirReference, UnresolvableReference, normalize_reference, parse_reference};
pub use id::{IdError, IdGenerator, IdStrategy, generate_id, validate_id};
pub use search_index::{
    IndexedResource, SearchParamCatalog, SearchParamDefinition, SearchParamType,
    SearchParameterSource,
};

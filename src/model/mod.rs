//! Desired-state model.
//!
//! Typed representation of declared resources: identifiers, attribute
//! values with structural equality, and interpolation references that
//! create implicit dependencies between resources.

mod id;
mod reference;
mod resource;
mod value;

pub use id::{ResourceId, is_valid_segment};
pub use reference::{Reference, resolve_value, scan_references};
pub use resource::Resource;
pub use value::Value;

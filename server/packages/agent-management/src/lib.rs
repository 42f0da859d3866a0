//! Agent identifiers, definitions, and executable resolution.

pub mod agents;
pub mod testing;

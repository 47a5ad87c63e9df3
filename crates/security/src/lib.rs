//! Security policies for tiller tools.
//!
//! Provides:
//! - **Path policy**: confine file tools to the working directory, block forbidden paths
//! - **Pattern policy**: glob allow/deny lists over tool arguments

pub mod path;
pub mod patterns;

pub use path::{PathPolicy, PathValidationError};
pub use patterns::{PatternPolicy, PatternVerdict};

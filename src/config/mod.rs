//! Stack configuration.
//!
//! This module handles everything about stack files:
//! - Parsing and deserializing `infragraph.stack.yaml`
//! - `${name.path}` reference templates
//! - Validation of stack contents
//! - Computing hashes for change detection

mod hash;
mod parser;
mod spec;
mod template;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_stack_file, ConfigParser, DEFAULT_STACK_FILES};
pub use spec::{
    EngineConfig, ProjectConfig, ResourceConfig, StackConfig, StateBackend, StateConfig,
    VariableConfig,
};
pub use template::{parse_template, references, value_references, Reference, Segment};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};

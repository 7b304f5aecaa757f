//! Stack configuration module.
//!
//! This module handles all stack-program functionality:
//! - Parsing and deserializing `converge.stack.yaml`
//! - Validation of stack values
//! - Computing stack and property hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    CheckConfig, ComplianceConfig, ControlConfig, ExecutionConfig, ProjectConfig, ProviderConfig,
    ResourceDecl, RetryPolicy, StackConfig, StateBackend, StateConfig, type_package,
};
pub use parser::{DEFAULT_STACK_FILES, StackParser, find_stack_file};
pub use validator::{DEFAULT_PROVIDER_KEY, StackValidator, ValidationResult};
pub use hash::StackHasher;

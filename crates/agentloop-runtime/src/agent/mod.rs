//! Agent assembly and the execution loop.
//!
//! - `config`: serializable runtime settings and the assembled configuration
//! - `builder`: fluent construction of a [`DeepAgent`]
//! - `runtime`: the turn loop itself

pub mod builder;
pub mod config;
pub mod runtime;

pub use builder::{create_deep_agent_from_config, ConfigurableAgentBuilder, BUILTIN_TOOL_NAMES};
pub use config::{DeepAgentConfig, PrebuiltSubAgent, RetryPolicy, RuntimeSettings};
pub use runtime::{DeepAgent, TurnOutcome, TurnStatus};

#[cfg(test)]
mod scenario_tests;

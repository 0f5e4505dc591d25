//! One-shot commands for the gateway binary
//!
//! `serve` lives in [`crate::server`]; everything else here runs a single
//! operation and prints the result to stdout.
//!
//! ```bash
//! # Invoke a route once
//! integration-gateway --config gateway.yaml invoke search_hospitals --input '{"zip":"78701"}'
//!
//! # Print the cache key a request would use
//! integration-gateway key GET /hospitals zip=78701 radius=10
//!
//! # Validate configuration
//! integration-gateway --config gateway.yaml check
//! ```

pub mod commands;

pub use commands::{cmd_check, cmd_invoke, cmd_key, describe_config, parse_params};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

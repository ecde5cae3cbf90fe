//! Command-line interface for swhid-conformance.
//!
//! Provides the `run`, `list-impls` and `list-payloads` commands plus the
//! hidden `worker` entry point used to host built-in implementations in a
//! sandboxed child.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};

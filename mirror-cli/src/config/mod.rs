//! Configuration lookup, parsing and validation.
//!
//! This module takes care of sourcing configuration options from
//! multiple inputs (CLI flags and environment variables), merging, and
//! validating them. It contains the following entities:
//!  * "options": CLI fragments, optional and stringly-typed;
//!  * "environment": credential and verbosity fallbacks;
//!  * "app settings": runtime settings, result of validation.

mod cli;
mod settings;

pub use self::cli::CliOptions;
pub use self::settings::{AppSettings, Environment, PullSettings, PushSettings};

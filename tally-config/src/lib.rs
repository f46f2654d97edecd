//! Configuration for the tally daemon.
//!
//! A single YAML file is loaded at startup. Every option has a default, so an
//! empty file is a valid configuration; a misconfigured node fails to start
//! with an error naming the offending option.

mod config;
mod listen;

pub use self::config::*;
pub use self::listen::*;

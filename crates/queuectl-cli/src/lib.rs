//! # queuectl-cli
//!
//! Administrative surface for queuectl: argument parsing, logging setup,
//! signal handling, and thin command wrappers over the job repository,
//! config store, and worker.

pub mod cli;
pub mod commands;
pub mod logging;
pub mod shutdown;

pub use cli::{Cli, Commands, ConfigCommand, DlqCommand, WorkerCommand, WorkerStartArgs};

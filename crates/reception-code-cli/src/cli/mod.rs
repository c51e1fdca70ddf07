//! Argument parsing, telemetry setup and the commands the binary runs.

pub mod commands;
pub mod config;
pub mod telemetry;

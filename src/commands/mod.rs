//! Subcommand implementations

pub mod replay;
pub mod run;
pub mod status;

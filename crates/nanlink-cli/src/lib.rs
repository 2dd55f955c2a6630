//! nanlink CLI library
//!
//! Wires the runtime to an in-process airspace so both roles of a session
//! can be exercised from one terminal.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::{ChatApp, Participant, PeerBehavior};
pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::CliConfig;
pub use error::{CliError, Result};

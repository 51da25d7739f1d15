//! Command line entry: arguments and environment become a [`config::ServerConfig`],
//! logging is initialized, and the resulting [`actions::Action`] runs the authority.
//!
//! [`config::ServerConfig`]: crate::config::ServerConfig

pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod telemetry;

mod start;
pub use self::start::start;

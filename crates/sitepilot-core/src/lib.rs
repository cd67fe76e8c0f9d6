//! Sitepilot Core - Shared functionality for Sitepilot tools
//!
//! Sitepilot connects a website to analysis workers and applies their fixes.
//! This crate holds what every tool needs to agree on: where state lives.

pub mod paths;

pub use paths::Paths;

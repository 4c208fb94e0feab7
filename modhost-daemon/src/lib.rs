//! modhost daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod builtin;
pub mod config;
pub mod host;
pub mod metadb;
pub mod notifications;
pub mod runner;

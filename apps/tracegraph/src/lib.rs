//! # tracegraph
//!
//! Application layer over `tracegraph-core`: configuration, the HTTP API and
//! the command line.

pub mod api;
pub mod cli;
pub mod config;

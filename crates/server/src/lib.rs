//! # Brain Server
//!
//! Request-facing assembly of the Second Brain daemon: configuration, the
//! rate-limited service facade, the generation client, and the HTTP router.
//! The `brain-server` binary wires these to the watcher/resync pipeline.

pub mod config;
pub mod generate;
pub mod http;
pub mod service;

//! Keel Orchestrator
//!
//! The deployment progression engine: composes the effective configuration
//! of a trigger, journals releases, publishes manifests and folds reconciler
//! events into per-runner timelines. The binary in `main.rs` wires it to
//! PostgreSQL, the HTTP collaborators and an axum transport.

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod repository;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

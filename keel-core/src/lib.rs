//! Keel Core
//!
//! Core types and abstractions for the Keel deployment progression engine.
//!
//! This crate contains:
//! - Domain types: deployment entities (Pipeline, ReleaseOverride, Runner, etc.)
//! - DTOs: trigger requests, reconciler events and CD events
//! - Collaborator interfaces: GitOps provider, chart registry, cluster reads, notifier

pub mod collab;
pub mod domain;
pub mod dto;

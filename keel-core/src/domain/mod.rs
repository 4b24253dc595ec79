//! Core domain types
//!
//! This module contains the deployment entities shared between the engine
//! (which persists and progresses them) and the collaborator clients.

pub mod catalog;
pub mod chart;
pub mod config;
pub mod history;
pub mod release;
pub mod runner;
pub mod status;
pub mod timeline;
pub mod variable;

//! Data Transfer Objects
//!
//! Requests and events crossing the engine boundary: triggers from callers,
//! application status events from the CD agent, and CD events for the notifier.

pub mod event;
pub mod reconciler;
pub mod trigger;

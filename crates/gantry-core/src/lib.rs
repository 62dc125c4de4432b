//! Gantry Core
//!
//! Core domain types, traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: pipeline definitions as authored, the
//! job instances a run expands them into, and the outcomes they produce.

pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod secrets;

pub use error::{DefinitionError, Error, Result};
pub use ids::*;

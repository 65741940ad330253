//! # ModelForge
//!
//! ModelForge is an AutoML pipeline orchestrator: a user describes the
//! image-classification model they want in natural language, and a set of
//! cooperating agents drive the project through dataset acquisition, model
//! training, evaluation, and packaging without further user intervention.
//!
//! ## Architecture
//!
//! - **Planner agent**: turns one utterance into a validated plan and a
//!   project row in `pending_dataset`
//! - **Dataset / training / evaluation agents**: poll the shared store for
//!   projects in the status they own, run their workflow, and advance the
//!   status with a conditional update
//! - **Orchestrator gateway**: public REST facade over projects, logs,
//!   bundle downloads, and admin views
//! - **Store / object store adapters**: the only channels agents share
//!   state through
//!
//! Coordination rests on a single primitive: `advance_status`, a
//! status-conditional update on the project row. Artifacts are always
//! written and verified before the status flip that advertises them.

/// Worker agents and the shared workflow failure policy
pub mod agents;
/// Dataset archive extraction
pub mod archive;
/// User bundle assembly
pub mod bundle;
/// System configuration
pub mod config;
/// Dataset source search and retrieval
pub mod dataset_source;
/// Error types and the retry taxonomy
pub mod error;
/// Public REST facade
pub mod gateway;
/// Chat-completion client
pub mod llm;
/// Core data models
pub mod models;
/// Object store adapter
pub mod objects;
/// Planner agent and plan schema
pub mod planner;
/// Shared poll-and-claim runtime
pub mod polling;
/// Per-agent HTTP surfaces
pub mod service;
/// Project-name slugs
pub mod slug;
/// Typed access to the shared relational store
pub mod store;
/// Training backend
pub mod training;
/// Scoped scratch directories
pub mod workdir;

#[cfg(test)]
mod tests;

pub use error::{ErrorKind, ForgeError, Result};

//! Cross-module lifecycle tests: whole-pipeline scenarios that exercise the
//! planner, the worker agents, and the gateway against the in-memory store
//! and a local object store.

#[cfg(test)]
mod pipeline_tests;

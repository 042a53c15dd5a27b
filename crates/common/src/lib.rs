//! Shared types for the cluster workspace.
//!
//! Keep the management-server/agent boundary types here so both sides agree on the wire shape.

#![warn(missing_docs)]

/// Shared command/answer and VM state types.
pub mod api;

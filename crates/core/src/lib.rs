//! Pure domain logic for the generation worker.
//!
//! Holds the execution graph model used to weight ComfyUI workflow nodes
//! and the progress tracker that turns a node-execution event stream into
//! a monotonic percentage with time estimates. Nothing in this crate
//! performs I/O.

pub mod error;
pub mod progress;
pub mod types;
pub mod workflow_graph;

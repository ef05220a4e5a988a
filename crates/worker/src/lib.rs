//! Generation worker: polls the job table, runs each job on ComfyUI with
//! live progress, and uploads the results.

pub mod config;
pub mod poller;
pub mod processor;
pub mod workflow;

//! Streaming and recovery engine for AI-assisted technical interviews.

pub mod adapters;
pub mod assignment;
pub mod broadcast;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod prompt;
pub mod router;
pub mod store;
pub mod threads;
pub mod types;

//! Converters from each backend's native event payloads into [`crate::AgentEvent`].

pub mod graph;
pub mod tool_agent;

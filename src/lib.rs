//! Conveyor — asynchronous agent-execution pipeline.
//!
//! A recurring-task scheduler, a durable job queue, a worker that drives a
//! multi-step LLM tool-calling loop, a resumable stream relay bridging
//! queued output to live HTTP clients, and a context compactor bounding
//! conversation growth.

pub mod compaction;
pub mod config;
pub mod error;
pub mod llm;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tools;
pub mod worker;

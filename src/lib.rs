//! `nodeflow`: a workflow engine for node graphs.
//!
//! A flow is a set of typed [`graph::Node`]s joined by [`graph::Edge`]s. The
//! [`flow::FlowExecutor`] runs it level by level, re-running the downstream of
//! every iterator once per item, and [`flow::manager::ExecutionService`] tracks
//! runs through their lifecycle.

pub mod agent;
pub mod capability;
pub mod config;
pub mod environment;
pub mod error;
pub mod flow;
pub mod graph;
pub mod logger;
pub mod node;
pub mod nodes;
pub mod result;
pub mod schema;
pub mod store;
pub mod template;
pub mod util;

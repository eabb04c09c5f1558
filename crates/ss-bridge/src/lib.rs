//! HTTP facade for the pipeline: a thin axum layer that reads the store
//! and hands control commands to the daemon over a channel.

pub mod commands;
pub mod http_api;

pub use commands::{AnalyzeTarget, EngineCommand};
pub use http_api::{api_router, ApiState};

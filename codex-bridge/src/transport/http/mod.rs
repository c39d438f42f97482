//! HTTP transport: axum routes over a [`BridgeService`](crate::service::BridgeService).

mod models;
mod routes;
mod server;

pub use models::{
    SandboxPolicy, SkillsConfigWriteParams, SkillsListParams, ThreadForkParams, ThreadReadParams,
    ThreadResumeParams, ThreadStartParams, TurnInput, TurnInputType, TurnStartParams,
};
pub use routes::{HealthCheckResponse, routes};
pub use server::{ServerConfig, serve};

//! Node agent that pins containers to dedicated CPUs according to the
//! placement published by a topology-aware scheduler.

pub mod app;
pub mod cmd;
pub mod config;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod platform;
pub mod policy;
pub mod state;
pub mod topology;

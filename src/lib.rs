pub mod artifacts;
pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod gates;
pub mod launcher;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod telemetry;
pub mod ui;
pub mod util;

pub use orchestrator::{Orchestrator, RunRequest, RunState};

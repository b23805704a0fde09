pub mod advisory;
pub mod artifact;
pub mod config;
pub mod dag;
pub mod errors;
pub mod escalation;
pub mod gates;
pub mod learning;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
pub mod util;

pub mod config;
pub mod diff;
pub mod errors;
pub mod labels;
pub mod metrics;
pub mod quantity;
pub mod state;
pub mod telemetry;

pub mod config;
pub mod defense;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod phase;
pub mod recon_config;
pub mod scheduler;
pub mod summary;
pub mod throttle;
pub mod ui;
pub mod workers;

pub mod batch;
pub mod calibration;
pub mod confidence;
pub mod config;
pub mod error;
pub mod league_params;
pub mod markets;
pub mod match_analysis;
pub mod odds;
pub mod orchestrator;
pub mod records;
pub mod simulator;
pub mod snapshot;
pub mod team_strength;

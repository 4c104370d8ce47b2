//! Orchestrator storage: data directory layout and settings

pub mod layout;
pub mod settings;

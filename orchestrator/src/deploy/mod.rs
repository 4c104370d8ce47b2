//! App deployment: source sync, build manifests, the app status machine and
//! the deploy pipeline itself

pub mod fsm;
pub mod git;
pub mod manifest;
pub mod pipeline;

pub use pipeline::{DeployOptions, DeployOrchestrator, DeployRequest, NewApp, APP_LABEL};

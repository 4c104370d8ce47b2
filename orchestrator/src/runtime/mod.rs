//! Container engine adapter

pub mod docker;

pub use docker::{DockerCli, InstanceState, Mount, PollOptions, RunSpec};

pub mod arm;
pub mod builder;
pub mod json_api;
pub mod retry;
pub mod settings;
pub mod ssh_client;
pub mod state;
pub mod steps;
pub mod tempname;

#[cfg(test)]
pub mod mocks;

pub use builder::{Artifact, BuildReport, BuildResult, Builder};

//! `[otdb]`, `[slurm]` and `[pipeline]` sections of `obsflow.toml`.
//!
//! The `[bus]` and `[services.*]` sections of the same file are read by
//! [`obsflow_bus::BusConfig`].

mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use types::{ControllerConfig, OtdbSection, PipelineSection, RunnerKind, SlurmSection};

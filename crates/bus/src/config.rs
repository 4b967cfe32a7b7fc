//! `[bus]` and `[services.*]` sections of `obsflow.toml`.
//!
//! Other sections of the same file belong to the controller and are ignored
//! here, so the broker and the controller can share one file.

mod loading;
mod types;
mod validation;


pub use types::{BusConfig, BusSection, ServiceConfig};

//! Control plane for per-user remote desktop environments.
//!
//! Each identity owns at most one environment: a desktop compute unit, its
//! storage claim, an internal endpoint, an HTTP ingress and, optionally, an
//! SSH port on the shared routing layer. [`control::ControlPlane`] is the
//! entry point for request handlers; the components below it can be used
//! on their own.

pub mod auth;
pub mod cluster;
pub mod config;
pub mod control;
pub mod error;
pub mod lock;
pub mod naming;
pub mod orchestrator;
pub mod ports;
pub mod rate_limit;
pub mod store;

pub use config::Config;
pub use control::{ControlPlane, CreateRequest, ProvisionedEnvironment};
pub use error::{ApiError, ControlError, ErrorKind};

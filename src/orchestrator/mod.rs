//! Environment orchestration.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              EnvironmentOrchestrator                │
//! │                                                     │
//! │  create()  ── lock env:{user} ── storage claim      │
//! │                                  compute unit       │
//! │                                  endpoint           │
//! │                                  ingress            │
//! │                                  ssh mapping (opt)  │
//! │  delete()  ── lock env:{user} ── ingress, endpoint, │
//! │                                  compute unit, wait,│
//! │                                  storage (opt)      │
//! │  get()/list()  read-through descriptor cache        │
//! └─────────────────────────────────────────────────────┘
//! ```

mod descriptor;
mod environment;
pub mod manifests;

pub use descriptor::{AccessInfo, EnvStatus, EnvironmentDescriptor, EnvironmentSummary, StatusDetail};
pub use environment::{CreateOutcome, DEFAULT_LOG_LINES, EnvironmentOrchestrator, ProvisionOptions};

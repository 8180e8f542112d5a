//! kts-runner library
//!
//! Host-side plumbing for the knowledge-base backend CLI:
//! - Managed Python environment provisioning and health
//! - Runner selection between the managed environment and a packaged executable
//! - Bounded process execution with streamed progress
//! - Workspace resolution and result parsing

pub mod config;
pub mod context;
pub mod doctor;
pub mod environment;
pub mod error;
pub mod parse;
pub mod process;
pub mod runner;
pub mod selector;
pub mod workspace;

pub use context::{ActivationStatus, BackendContext, BackendRequest};
pub use error::{EnvironmentError, InvokeError, ProcessError, RunnerError, SelectionError};
pub use parse::{parse_result, ParsedResult};

//! Sandboxed execution of learner code with per-assertion test validation,
//! for TypeScript and Python.
//!
//! Embed a [`SandboxHost`] per learner session, or run the bundled gRPC
//! server (`lesson-runner` binary).

pub mod config;
pub mod constants;
pub mod core;
pub mod grpc;
pub mod native;
pub mod stubs;

pub use crate::config::Config;
pub use crate::core::{
    domain::{
        EngineStatus, ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, Language,
        SourceLocation, TestOutcome, TestSpec,
    },
    host::{HostLimits, SandboxHost},
};

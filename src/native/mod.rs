//! Runners backed by local interpreter processes.
pub mod python;
pub mod typescript;
pub mod worker;

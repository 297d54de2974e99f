pub mod aggregate;
pub mod domain;
pub mod harness;
pub mod host;
pub mod pipeline;
pub mod traits;

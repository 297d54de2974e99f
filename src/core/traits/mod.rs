pub mod realm;
pub mod runner;

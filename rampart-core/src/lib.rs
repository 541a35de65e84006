pub mod backend;
pub mod config;
pub mod engine;
pub mod exec;
pub mod notify;
pub mod operation;
pub mod probes;
pub mod report;
pub mod retention;
pub mod store;
pub mod wait;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

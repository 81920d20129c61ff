pub mod config;
pub mod execution;
pub mod signing;
pub mod splitter;
pub mod telemetry;
pub mod util;

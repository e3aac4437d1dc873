//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod drivers;
pub mod error;
pub mod http;
pub mod telemetry;

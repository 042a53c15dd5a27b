pub mod config;
pub mod error;
pub mod heartbeat;
pub mod runner;
pub mod runtime;
pub mod services;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod version;

#[cfg(test)]
pub mod test_support;

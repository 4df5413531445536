pub mod auth;
pub mod channel;
pub mod commander;
pub mod config;
pub mod metrics;
pub mod request;
pub mod routes;
pub mod state;
pub mod stats;
pub mod telemetry;

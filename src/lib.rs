//! Polls vehicle telemetry from A Better Route Planner (Iternio) and exposes
//! it as sensors, one set per configured vehicle.

pub mod abrp;
pub mod config;
pub mod config_flow;
pub mod coordinator;
pub mod send_telemetry;
pub mod sensor;
pub mod server;
pub mod telemetry;

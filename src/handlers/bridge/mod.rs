pub mod bus;
pub mod monitor;
pub mod telemetry;

pub mod fanout;
pub mod telemetry;

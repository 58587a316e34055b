// Domain layer - Stream models and pure computation
pub mod aggregator;
pub mod comparison;
pub mod envelope;
pub mod interval;
pub mod stream_series;
pub mod telemetry;
pub mod vartype;

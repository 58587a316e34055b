// Application layer - Backend contract and stream group orchestration
pub mod analysis_group;
pub mod channel;

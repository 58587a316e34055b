// Infrastructure layer - External dependencies and adapters
pub mod archive_channel;
pub mod auth;
pub mod cloud_channel;
pub mod config;
pub mod offline;
pub mod session;
pub mod transport;

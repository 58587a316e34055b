// Stream analytics - interchangeable stream backends and aggregation
pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::analysis_group::{AnalysisGroup, FetchMode, FetchReport};
pub use application::channel::Channel;
pub use error::{AnalyticsError, Result};

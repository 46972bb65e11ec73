pub mod adapters;
pub mod config;
pub mod constants;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod sink;
pub mod summary;
pub mod types;

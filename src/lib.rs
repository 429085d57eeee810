pub mod analysis;
pub mod config;
pub mod error;
pub mod metrics;
pub mod recorder;
pub mod sampler;
pub mod store;
pub mod supervisor;

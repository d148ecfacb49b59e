pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod models;
pub mod pruner;
pub mod store;
pub mod synthesizer;
pub mod usage;

#[cfg(test)]
mod regression_test;

pub use cache::ResultCache;
pub use config::EngineConfig;
pub use engine::{FilterEngine, FilterStatistics};
pub use error::{FilterError, Result};
pub use models::{ApplyResult, EmailRecord, Filter, FilterCriteria, FilterPatch, FilterPerformance};
pub use store::{FilterStore, SqliteFilterStore};

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod distribution;
pub mod event;
pub mod persistence;
pub mod region;
pub mod transaction;

pub use cache::{Cache, Region};
pub use config::TransactionConfig;

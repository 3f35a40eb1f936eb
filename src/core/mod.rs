pub mod types;
pub mod error;
pub mod config;
pub mod stats;
pub mod context;
pub mod transaction;
pub mod resource_cache;
pub mod collection;
pub mod database;

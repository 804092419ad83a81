pub mod auth;
pub mod indexer;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod storage;
pub mod utils;

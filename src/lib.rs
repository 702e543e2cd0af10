pub mod cli;
pub mod config;
pub mod encode;
pub mod engine;
pub mod metrics;
pub mod planner;
pub mod retry;
pub mod source;
pub mod storage;

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod enrich;
pub mod generator;
pub mod log;
pub mod record;
pub mod scoring;
pub mod sink;
pub mod stage;
pub mod storage;
pub mod stream;

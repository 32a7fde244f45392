pub mod commands;
pub mod config;
pub mod dedup;
pub mod device_id;
pub mod engine;
pub mod sessions;

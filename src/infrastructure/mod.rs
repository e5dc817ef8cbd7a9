pub mod config;
pub mod event_publisher;
pub mod in_memory_store;
pub mod redis_store;
pub mod sweep_scheduler;
pub mod telemetry;

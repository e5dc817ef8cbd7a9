pub mod http_metrics;
pub mod quota_guard;

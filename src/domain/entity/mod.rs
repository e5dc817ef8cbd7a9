pub mod period;
pub mod policy;
pub mod quota;

pub use period::ResetPolicy;
pub use policy::{MetricDefinition, PolicyError, QuotaPolicy, ServicePolicy};
pub use quota::{
    CounterKey, Decision, Denial, Limit, MetricUsage, Remaining, StoreFailureMode, Subject,
    UsageCounter, UsageSnapshot,
};

pub mod clock;
pub mod quota_resolver;

pub use clock::{Clock, ManualClock, SystemClock};
pub use quota_resolver::{QuotaResolver, ResolvedQuota};

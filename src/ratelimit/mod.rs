//! Rate limiting logic and state management.

pub mod adaptive;
pub mod class;
pub mod clock;
pub mod key;
mod limiter;
pub mod policy;
pub mod size;
pub mod store;

pub use adaptive::{AdaptiveController, RetriggerPolicy};
pub use class::OperationClass;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{RateLimitKey, RequestDescriptor};
pub use limiter::{Decision, RateLimitHeaders, RateLimitHealth, RateLimiter};
pub use policy::{Policy, PolicyTable, ResolvedPolicy};
pub use size::{check_content_length, SizeBucket};
pub use store::{RateLimitStore, RateWindowEntry, StoreStats, Sweeper, WindowDecision};

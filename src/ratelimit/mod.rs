//! Rate limiting logic.

mod backend;
mod key;
mod limiter;
mod locks;
mod policy;

pub use backend::RateLimiterBackend;
pub use key::CounterKey;
pub use limiter::{Decision, LimiterStore};
pub use locks::LockShards;
pub use policy::RatePolicy;

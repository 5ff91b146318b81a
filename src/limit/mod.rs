//! Rate limiting logic and state management.

mod block;
mod decision;
mod limiter;
mod policy;
mod store;
mod strategy;

pub use block::{BlockList, BlockState};
pub use decision::{LimitDecision, Outcome};
pub use limiter::RateLimiter;
pub use policy::{LimitPolicy, PolicyProvider};
pub use store::{CounterStore, LogEntry, MemoryStore, RedisStore, StoreError, UsageSnapshot};
pub use strategy::Strategy;

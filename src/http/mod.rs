//! HTTP middleware adapter for the rate limiter.

mod middleware;
mod tiers;

pub use middleware::{
    derive_identifier, rate_limit_middleware, route_limit_middleware, Principal, RateLimitState,
    RouteLimit,
};
pub use tiers::{Tier, TierMap};

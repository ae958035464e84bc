//! Rate limiting logic and state management.

mod algorithm;
mod fixed_window;
mod limiter;
mod rules;
mod sliding_window;
mod token_bucket;

pub use algorithm::{build_algorithm, Decision, RateLimitAlgorithm};
pub use fixed_window::FixedWindowLimiter;
pub use limiter::{CheckRequest, CheckResponse, RateLimiter};
pub use rules::{ClientRules, Rule, RuleResolver, RuleSet};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

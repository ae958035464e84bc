//! HTTP surface of the service.

mod correlation;
mod routes;
mod server;

pub use correlation::CORRELATION_HEADER;
pub use routes::{router, AppState, RuleInfo, UpdateRuleRequest};
pub use server::HttpServer;
